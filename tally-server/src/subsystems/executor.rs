//! Query executor — runs one validated statement against the approved view
//!
//! Execution discipline:
//! - read-only transaction, so the §4.2 invariant holds even if a hostile
//!   statement slipped past validation
//! - `SET LOCAL statement_timeout` inside the transaction plus a wall-clock
//!   tokio timeout around the whole stage
//! - hard row cap: the statement is wrapped with `LIMIT cap + 1` and an
//!   over-full result is an error, not a silent truncation
//!
//! The generated SELECT is wrapped in a `json_agg(row_to_json(..))` envelope
//! so rows come back as JSON objects with their column names preserved,
//! whatever columns the planner chose.

use sqlx::PgPool;
use std::time::Duration;
use tally_core::config::QueryConfig;
use tally_core::{GeneratedQuery, TallyError};

/// Ordered rows from one execution; each row is a JSON object keyed by
/// column name.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    pub rows: Vec<serde_json::Value>,
}

impl ResultSet {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Wrap the generated statement in the row-cap and JSON envelope.
fn wrap_statement(sql: &str, cap_plus_one: u32) -> String {
    format!(
        "SELECT COALESCE(json_agg(row_to_json(r)), '[]'::json) \
         FROM (SELECT * FROM ({sql}) q LIMIT {cap_plus_one}) r"
    )
}

pub async fn execute_query(
    pool: &PgPool,
    query: &GeneratedQuery,
    config: &QueryConfig,
) -> Result<ResultSet, TallyError> {
    let wrapped = wrap_statement(&query.sql, config.max_rows + 1);
    let wall_clock = Duration::from_secs(config.execution_timeout_seconds);

    let fetched = tokio::time::timeout(
        wall_clock,
        fetch_json_rows(pool, &wrapped, config.statement_timeout_ms),
    )
    .await
    .map_err(|_| {
        TallyError::Execution(format!(
            "query exceeded wall-clock timeout of {}s",
            config.execution_timeout_seconds
        ))
    })??;

    if fetched.len() > config.max_rows as usize {
        return Err(TallyError::Execution(format!(
            "result exceeds row cap of {}",
            config.max_rows
        )));
    }

    tracing::debug!(rows = fetched.len(), sql = %query.sql, "Query executed");

    Ok(ResultSet { rows: fetched })
}

async fn fetch_json_rows(
    pool: &PgPool,
    wrapped_sql: &str,
    statement_timeout_ms: u64,
) -> Result<Vec<serde_json::Value>, TallyError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| TallyError::Execution(format!("failed to open transaction: {e}")))?;

    sqlx::query("SET TRANSACTION READ ONLY")
        .execute(&mut *tx)
        .await
        .map_err(|e| TallyError::Execution(format!("failed to set read-only mode: {e}")))?;

    sqlx::query(&format!(
        "SET LOCAL statement_timeout = {statement_timeout_ms}"
    ))
    .execute(&mut *tx)
    .await
    .map_err(|e| TallyError::Execution(format!("failed to set statement timeout: {e}")))?;

    let row: (serde_json::Value,) = sqlx::query_as(wrapped_sql)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| TallyError::Execution(e.to_string()))?;

    // Nothing to commit on a read-only transaction
    tx.rollback().await.ok();

    match row.0 {
        serde_json::Value::Array(rows) => Ok(rows),
        other => Err(TallyError::Execution(format!(
            "unexpected result envelope: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_statement_embeds_cap_and_envelope() {
        let wrapped = wrap_statement("SELECT merchant FROM approved_tickets", 201);
        assert!(wrapped.contains("json_agg(row_to_json(r))"));
        assert!(wrapped.contains("(SELECT merchant FROM approved_tickets) q LIMIT 201"));
    }

    #[test]
    fn test_result_set_emptiness() {
        assert!(ResultSet::default().is_empty());
        let set = ResultSet {
            rows: vec![serde_json::json!({"merchant": "Bean There"})],
        };
        assert!(!set.is_empty());
        assert_eq!(set.len(), 1);
    }
}
