//! Tool dispatcher — decides when database evidence is not enough
//!
//! Decision policy (deterministic, applied in this order):
//! 1. the database returned no rows, or
//! 2. the question matches the out-of-domain detector (general-world
//!    lookups the expense schema cannot answer).
//!
//! The search call itself is best-effort: a `ToolError` degrades the
//! request to database-only context and is recorded, never fatal.

use regex::RegexBuilder;
use tally_core::{SearchClient, SearchHit};

use super::executor::ResultSet;

/// Question shapes that clearly reach outside the expense schema.
const OUT_OF_DOMAIN_PATTERNS: [&str; 5] = [
    r"\bweather\b",
    r"\bnews\b|\bheadlines?\b",
    r"\bstock\s+price\b|\bexchange\s+rate\b|\bmarket\s+price\b",
    r"\bwho\s+is\b|\bwhat\s+is\s+the\s+capital\b",
    r"\bbest\s+practices?\b",
];

/// True when the pipeline should consult the external search tool.
pub fn should_search(question: &str, database_rows: &ResultSet) -> bool {
    if database_rows.is_empty() {
        return true;
    }
    is_out_of_domain(question)
}

fn is_out_of_domain(question: &str) -> bool {
    OUT_OF_DOMAIN_PATTERNS.iter().any(|pattern| {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .expect("out-of-domain pattern must compile")
            .is_match(question)
    })
}

/// Outcome of one dispatch attempt.
pub struct DispatchOutcome {
    pub hits: Vec<SearchHit>,
    /// True when the tool failed and the pipeline continued without it.
    pub degraded: bool,
}

/// Invoke the search tool once; degrade gracefully on any failure.
pub async fn dispatch(client: Option<&SearchClient>, question: &str) -> DispatchOutcome {
    let Some(client) = client else {
        tracing::debug!("Search tool not configured; proceeding database-only");
        return DispatchOutcome {
            hits: Vec::new(),
            degraded: false,
        };
    };

    match client.search(question).await {
        Ok(hits) => {
            tracing::info!(hits = hits.len(), "Search tool returned results");
            DispatchOutcome {
                hits,
                degraded: false,
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Search tool failed; degrading to database-only context");
            DispatchOutcome {
                hits: Vec::new(),
                degraded: true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(n: usize) -> ResultSet {
        ResultSet {
            rows: (0..n).map(|i| serde_json::json!({"id": i})).collect(),
        }
    }

    #[test]
    fn test_empty_rows_trigger_search() {
        assert!(should_search("what did I spend on coffee?", &rows(0)));
    }

    #[test]
    fn test_populated_rows_with_domain_question_skip_search() {
        assert!(!should_search("what did I spend on coffee?", &rows(3)));
    }

    #[test]
    fn test_out_of_domain_question_triggers_search_despite_rows() {
        assert!(should_search("what's the weather today?", &rows(3)));
        assert!(should_search("latest news on interest rates", &rows(1)));
        assert!(should_search("what is the capital of Peru", &rows(2)));
    }

    #[tokio::test]
    async fn test_dispatch_without_client_is_quietly_database_only() {
        let outcome = dispatch(None, "anything").await;
        assert!(outcome.hits.is_empty());
        assert!(!outcome.degraded);
    }
}
