//! Persistence for evaluation runs and results
//!
//! Runs are the only mutable rows (status transitions and the final
//! averages); results are inserted exactly once. All access goes through
//! runtime-checked sqlx queries against the evaluation schema in
//! `migrations/`.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use tally_core::{
    EvaluationResult, EvaluationRun, MetricFamily, MetricScores, ResultStatus, RunStatus, RunType,
    TallyError,
};

type RunRow = (
    Uuid,
    String,
    String,
    String,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    Option<i32>,
    Option<i32>,
    serde_json::Value,
    serde_json::Value,
);

type ResultRow = (
    i32,
    Uuid,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    serde_json::Value,
    Option<i32>,
    Option<i32>,
    String,
    Option<String>,
    DateTime<Utc>,
);

const RUN_COLUMNS: &str = "run_id, metric_family, run_type, status, started_at, completed_at, \
                           total_queries, successful_queries, averages, metadata";

const RESULT_COLUMNS: &str = "id, run_id, item_id, question, generated_answer, retrieved_context, \
                              reference_answer, scores, response_time_ms, token_count, status, \
                              error_message, created_at";

/// A result row waiting to be written.
#[derive(Debug)]
pub struct NewResult {
    pub run_id: Uuid,
    pub item_id: String,
    pub question: String,
    pub generated_answer: Option<String>,
    pub retrieved_context: Option<String>,
    pub reference_answer: Option<String>,
    pub scores: MetricScores,
    pub response_time_ms: Option<i32>,
    pub token_count: Option<i32>,
    pub status: ResultStatus,
    pub error_message: Option<String>,
}

#[derive(Clone)]
pub struct EvaluationStore {
    pool: PgPool,
}

impl EvaluationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn create_run(
        &self,
        family: MetricFamily,
        run_type: RunType,
    ) -> Result<EvaluationRun, TallyError> {
        let run_id = Uuid::new_v4();

        let row: RunRow = sqlx::query_as(&format!(
            "INSERT INTO evaluation_runs (run_id, metric_family, run_type, status) \
             VALUES ($1, $2, $3, 'pending') RETURNING {RUN_COLUMNS}"
        ))
        .bind(run_id)
        .bind(family.as_str())
        .bind(run_type.as_str())
        .fetch_one(&self.pool)
        .await?;

        decode_run(row)
    }

    pub async fn mark_running(&self, run_id: Uuid) -> Result<(), TallyError> {
        sqlx::query("UPDATE evaluation_runs SET status = 'running' WHERE run_id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Finalize a run: terminal status, completion time, totals and the
    /// per-metric averages over successfully scored constituents.
    pub async fn complete_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        total_queries: i32,
        successful_queries: i32,
        averages: serde_json::Value,
    ) -> Result<(), TallyError> {
        sqlx::query(
            "UPDATE evaluation_runs \
             SET status = $2, completed_at = now(), total_queries = $3, \
                 successful_queries = $4, averages = $5 \
             WHERE run_id = $1",
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(total_queries)
        .bind(successful_queries)
        .bind(averages)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn abort_run(&self, run_id: Uuid, reason: &str) -> Result<(), TallyError> {
        sqlx::query(
            "UPDATE evaluation_runs \
             SET status = 'aborted', completed_at = now(), \
                 metadata = metadata || jsonb_build_object('abort_reason', $2::text) \
             WHERE run_id = $1",
        )
        .bind(run_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_result(&self, result: NewResult) -> Result<(), TallyError> {
        let scores = serde_json::to_value(&result.scores)
            .map_err(|e| TallyError::Other(format!("scores serialization: {e}")))?;

        sqlx::query(
            "INSERT INTO evaluation_results \
             (run_id, item_id, question, generated_answer, retrieved_context, reference_answer, \
              scores, response_time_ms, token_count, status, error_message) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(result.run_id)
        .bind(&result.item_id)
        .bind(&result.question)
        .bind(&result.generated_answer)
        .bind(&result.retrieved_context)
        .bind(&result.reference_answer)
        .bind(scores)
        .bind(result.response_time_ms)
        .bind(result.token_count)
        .bind(result.status.as_str())
        .bind(&result.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<EvaluationRun>, TallyError> {
        let row: Option<RunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM evaluation_runs WHERE run_id = $1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(decode_run).transpose()
    }

    pub async fn list_runs(
        &self,
        family: Option<MetricFamily>,
        limit: i64,
    ) -> Result<Vec<EvaluationRun>, TallyError> {
        let rows: Vec<RunRow> = match family {
            Some(f) => {
                sqlx::query_as(&format!(
                    "SELECT {RUN_COLUMNS} FROM evaluation_runs \
                     WHERE metric_family = $1 ORDER BY started_at DESC LIMIT $2"
                ))
                .bind(f.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {RUN_COLUMNS} FROM evaluation_runs \
                     ORDER BY started_at DESC LIMIT $1"
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(decode_run).collect()
    }

    pub async fn results_for_run(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<EvaluationResult>, TallyError> {
        let rows: Vec<ResultRow> = sqlx::query_as(&format!(
            "SELECT {RESULT_COLUMNS} FROM evaluation_results \
             WHERE run_id = $1 ORDER BY id"
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(decode_result).collect()
    }

    pub async fn latest_completed_run(
        &self,
        family: MetricFamily,
    ) -> Result<Option<EvaluationRun>, TallyError> {
        let row: Option<RunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM evaluation_runs \
             WHERE metric_family = $1 AND status = 'completed' \
             ORDER BY completed_at DESC LIMIT 1"
        ))
        .bind(family.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(decode_run).transpose()
    }

    pub async fn completed_runs_since(
        &self,
        family: MetricFamily,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<EvaluationRun>, TallyError> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM evaluation_runs \
             WHERE metric_family = $1 AND status = 'completed' AND completed_at >= $2 \
             ORDER BY completed_at"
        ))
        .bind(family.as_str())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(decode_run).collect()
    }

    /// Mean response time over successful results for a family.
    pub async fn avg_response_time_ms(
        &self,
        family: MetricFamily,
    ) -> Result<Option<f64>, TallyError> {
        let row: (Option<f64>,) = sqlx::query_as(
            "SELECT AVG(r.response_time_ms::float8) \
             FROM evaluation_results r \
             JOIN evaluation_runs er ON er.run_id = r.run_id \
             WHERE er.metric_family = $1 AND r.status = 'success'",
        )
        .bind(family.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }
}

fn decode_run(row: RunRow) -> Result<EvaluationRun, TallyError> {
    let (
        run_id,
        metric_family,
        run_type,
        status,
        started_at,
        completed_at,
        total_queries,
        successful_queries,
        averages,
        metadata,
    ) = row;

    Ok(EvaluationRun {
        run_id,
        metric_family: MetricFamily::parse(&metric_family)
            .ok_or_else(|| TallyError::Other(format!("unknown metric family '{metric_family}'")))?,
        run_type: RunType::parse(&run_type)
            .ok_or_else(|| TallyError::Other(format!("unknown run type '{run_type}'")))?,
        status: RunStatus::parse(&status)
            .ok_or_else(|| TallyError::Other(format!("unknown run status '{status}'")))?,
        started_at,
        completed_at,
        total_queries,
        successful_queries,
        averages,
        metadata,
    })
}

fn decode_result(row: ResultRow) -> Result<EvaluationResult, TallyError> {
    let (
        id,
        run_id,
        item_id,
        question,
        generated_answer,
        retrieved_context,
        reference_answer,
        scores,
        response_time_ms,
        token_count,
        status,
        error_message,
        created_at,
    ) = row;

    Ok(EvaluationResult {
        id,
        run_id,
        item_id,
        question,
        generated_answer,
        retrieved_context,
        reference_answer,
        scores: serde_json::from_value(scores)
            .map_err(|e| TallyError::Other(format!("scores deserialization: {e}")))?,
        response_time_ms,
        token_count,
        status: ResultStatus::parse(&status)
            .ok_or_else(|| TallyError::Other(format!("unknown result status '{status}'")))?,
        error_message,
        created_at,
    })
}
