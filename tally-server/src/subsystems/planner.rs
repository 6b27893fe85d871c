//! Schema-bound query planner — turns an approved question into one
//! read-only statement against the approved projection
//!
//! The model sees a static description of the single queryable view and a
//! prompt contract that demands a JSON object `{sql, intent}`. Whatever
//! comes back is validated before it can reach the executor: one statement,
//! retrieval-only, approved relations only. A violation is a
//! `PlanningError` carrying the offending text for audit.

use regex::RegexBuilder;
use serde::Deserialize;
use tally_core::{GeneratedQuery, GenerativeBackend, TallyError};

use super::guardrail::Guards;

/// The only relation a generated statement may reference.
pub const APPROVED_VIEW: &str = "approved_tickets";

/// Static description of the queryable schema, in the shape the planner
/// prompt expects. Only approved rows are visible through this view.
pub const SCHEMA_DESCRIPTION: &str = "\
Table: public.approved_tickets
Description: reviewed and approved expense receipts, one row per receipt.
Columns:
  id (bigint): receipt identifier.
  merchant (text): merchant name as printed on the receipt.
  purchased_on (date): date of the transaction.
  amount (numeric): total amount paid, in the account currency.
  items (jsonb): array of {description, price} line items.
  category (text): spending category, lowercase (e.g. 'coffee', 'groceries', 'travel').
";

const PLANNER_SYSTEM_PROMPT: &str = "\
You are an expert SQL system. Your ONLY job is to read a requirement and output \
a single SQL SELECT statement to run over the table below.
The statement must exactly match the table schema. Do not add, remove, or rename columns.
Query only this table; never write, modify, or reference any other relation.
If the requirement states no time range, query all time (add no date filter). \
Resolve relative time ranges (e.g. 'last month') against CURRENT_DATE.

### TABLE SCHEMA
{schema}

### RETURN FORMAT
Return ONLY a JSON object with two keys and no markdown decorators:
{\"sql\": \"<the SELECT statement>\", \"intent\": \"<one-sentence restatement of what it retrieves>\"}
";

const PLANNER_USER_PROMPT: &str = "\
Return the JSON object for the following required data.
--- UNTRUSTED CONTEXT START
{question}
--- UNTRUSTED CONTEXT END
";

#[derive(Debug, Deserialize)]
struct PlannerReply {
    sql: String,
    intent: String,
}

/// Plan one read-only query for `question`.
pub async fn plan_query(
    backend: &dyn GenerativeBackend,
    guards: &Guards,
    question: &str,
) -> Result<GeneratedQuery, TallyError> {
    let system = PLANNER_SYSTEM_PROMPT.replace("{schema}", SCHEMA_DESCRIPTION);
    let user = PLANNER_USER_PROMPT.replace("{question}", question);

    let generation = backend
        .generate(&system, &user)
        .await
        .map_err(|e| TallyError::Planning {
            reason: format!("model call failed: {e}"),
            generated: String::new(),
        })?;

    let raw = strip_code_fences(&generation.text);

    let reply: PlannerReply =
        serde_json::from_str(raw).map_err(|e| TallyError::Planning {
            reason: format!("reply is not the expected JSON object: {e}"),
            generated: generation.text.clone(),
        })?;

    let sql = reply.sql.trim().trim_end_matches(';').to_string();

    validate_statement(guards, &sql)?;

    tracing::info!(intent = %reply.intent, sql = %sql, "Planned query");

    Ok(GeneratedQuery {
        sql,
        intent: reply.intent,
        question: question.to_string(),
    })
}

/// Reject anything that is not a single retrieval statement over the
/// approved view.
pub fn validate_statement(guards: &Guards, sql: &str) -> Result<(), TallyError> {
    let planning_error = |reason: &str| TallyError::Planning {
        reason: reason.to_string(),
        generated: sql.to_string(),
    };

    let trimmed = sql.trim().trim_end_matches(';');

    if trimmed.is_empty() {
        return Err(planning_error("empty statement"));
    }

    if trimmed.contains(';') {
        return Err(planning_error("multiple statements"));
    }

    let lowered = trimmed.to_lowercase();
    if !(lowered.starts_with("select") || lowered.starts_with("with")) {
        return Err(planning_error("statement is not a SELECT"));
    }

    if let Err(e) = guards.screen_statement(trimmed) {
        return Err(planning_error(&e.to_string()));
    }

    for relation in referenced_relations(trimmed) {
        let bare = relation.rsplit('.').next().unwrap_or(&relation);
        if bare != APPROVED_VIEW {
            return Err(planning_error(&format!(
                "statement references relation '{relation}' outside the approved view"
            )));
        }
    }

    Ok(())
}

/// Named relations appearing after FROM/JOIN. Subqueries start with '(' and
/// are skipped by construction; CTE names are collected and excluded.
fn referenced_relations(sql: &str) -> Vec<String> {
    let relation_re = RegexBuilder::new(r"\b(?:from|join)\s+([a-zA-Z_][a-zA-Z0-9_\.]*)")
        .case_insensitive(true)
        .build()
        .expect("relation pattern must compile");
    let cte_re = RegexBuilder::new(r"(?:\bwith|,)\s*([a-zA-Z_][a-zA-Z0-9_]*)\s+as\s*\(")
        .case_insensitive(true)
        .build()
        .expect("cte pattern must compile");

    let cte_names: Vec<String> = cte_re
        .captures_iter(sql)
        .map(|c| c[1].to_lowercase())
        .collect();

    relation_re
        .captures_iter(sql)
        .map(|c| c[1].to_string())
        .filter(|r| !cte_names.contains(&r.to_lowercase()))
        .collect()
}

/// Models occasionally wrap replies in markdown fences despite the contract.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::ScriptedBackend;

    fn guards() -> Guards {
        Guards::new(2000)
    }

    /// Questions and the statements a well-behaved model yields for them.
    /// Every generated statement must pass validation; every statement in
    /// the rejected corpus must fail it.
    #[test]
    fn test_validator_over_statement_corpus() {
        let accepted = [
            "SELECT merchant, amount FROM approved_tickets",
            "SELECT SUM(amount) FROM approved_tickets WHERE category = 'coffee'",
            "select merchant, purchased_on from approved_tickets where purchased_on >= CURRENT_DATE - INTERVAL '30 days'",
            "SELECT category, COUNT(*) FROM approved_tickets GROUP BY category ORDER BY 2 DESC",
            "WITH monthly AS (SELECT date_trunc('month', purchased_on) m, SUM(amount) total FROM approved_tickets GROUP BY 1) SELECT * FROM monthly",
            "SELECT * FROM public.approved_tickets LIMIT 10",
        ];
        for sql in accepted {
            assert!(
                validate_statement(&guards(), sql).is_ok(),
                "should accept: {sql}"
            );
        }

        let rejected = [
            "DROP TABLE approved_tickets",
            "DELETE FROM approved_tickets WHERE id = 1",
            "SELECT * FROM tickets",
            "SELECT * FROM users",
            "SELECT * FROM approved_tickets; DELETE FROM approved_tickets",
            "UPDATE approved_tickets SET amount = 0",
            "EXPLAIN SELECT * FROM approved_tickets",
            "",
        ];
        for sql in rejected {
            assert!(
                validate_statement(&guards(), sql).is_err(),
                "should reject: {sql}"
            );
        }
    }

    #[test]
    fn test_rejection_carries_offending_text() {
        let err = validate_statement(&guards(), "SELECT * FROM raw_tickets").unwrap_err();
        match err {
            TallyError::Planning { generated, reason } => {
                assert!(generated.contains("raw_tickets"));
                assert!(reason.contains("outside the approved view"));
            }
            other => panic!("Expected Planning, got {other:?}"),
        }
    }

    #[test]
    fn test_cte_names_are_not_foreign_relations() {
        let sql = "WITH coffee AS (SELECT * FROM approved_tickets WHERE category = 'coffee') SELECT SUM(amount) FROM coffee";
        assert!(validate_statement(&guards(), sql).is_ok());
    }

    #[tokio::test]
    async fn test_plan_query_parses_model_reply() {
        let backend = ScriptedBackend::new(vec![
            r#"{"sql": "SELECT SUM(amount) FROM approved_tickets WHERE category = 'coffee'", "intent": "total coffee spending, all time"}"#,
        ]);

        let query = plan_query(&backend, &guards(), "how much on coffee?")
            .await
            .unwrap();
        assert!(query.sql.starts_with("SELECT SUM(amount)"));
        assert_eq!(query.intent, "total coffee spending, all time");
        assert_eq!(query.question, "how much on coffee?");
    }

    #[tokio::test]
    async fn test_plan_query_strips_markdown_fences() {
        let backend = ScriptedBackend::new(vec![
            "```json\n{\"sql\": \"SELECT merchant FROM approved_tickets\", \"intent\": \"list merchants\"}\n```",
        ]);

        let query = plan_query(&backend, &guards(), "which merchants?")
            .await
            .unwrap();
        assert_eq!(query.sql, "SELECT merchant FROM approved_tickets");
    }

    #[tokio::test]
    async fn test_plan_query_rejects_mutation_reply() {
        let backend = ScriptedBackend::new(vec![
            r#"{"sql": "DELETE FROM approved_tickets", "intent": "clear the table"}"#,
        ]);

        let err = plan_query(&backend, &guards(), "clear everything")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "planning_error");
    }

    #[tokio::test]
    async fn test_plan_query_rejects_non_json_reply() {
        let backend = ScriptedBackend::new(vec!["SELECT * FROM approved_tickets"]);

        let err = plan_query(&backend, &guards(), "everything")
            .await
            .unwrap_err();
        match err {
            TallyError::Planning { generated, .. } => {
                assert_eq!(generated, "SELECT * FROM approved_tickets");
            }
            other => panic!("Expected Planning, got {other:?}"),
        }
    }
}
