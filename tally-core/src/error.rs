use thiserror::Error;

/// Pipeline error taxonomy. Every stage failure maps onto exactly one
/// variant; `kind()` is the stable label surfaced in API error payloads.
#[derive(Error, Debug)]
pub enum TallyError {
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Query planning failed: {reason} (generated: {generated})")]
    Planning { reason: String, generated: String },

    #[error("Query execution failed: {0}")]
    Execution(String),

    #[error("Search tool failed: {0}")]
    Tool(String),

    #[error("Answer synthesis failed: {0}")]
    Synthesis(String),

    #[error("Metric scoring failed: {metric}: {reason}")]
    Scoring { metric: String, reason: String },

    #[error("Evaluation run aborted: {0}")]
    RunAbort(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl TallyError {
    /// Stable machine-readable error kind for API responses and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TallyError::PolicyViolation(_) => "policy_violation",
            TallyError::Planning { .. } => "planning_error",
            TallyError::Execution(_) => "execution_error",
            TallyError::Tool(_) => "tool_error",
            TallyError::Synthesis(_) => "synthesis_error",
            TallyError::Scoring { .. } => "scoring_error",
            TallyError::RunAbort(_) => "run_abort",
            TallyError::Database(_) => "database_error",
            TallyError::Config(_) => "config_error",
            TallyError::Io(_) => "io_error",
            TallyError::Other(_) => "other",
        }
    }

    /// Recoverable errors degrade the request instead of failing it
    /// (the search tool is the only stage allowed to degrade).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TallyError::Tool(_) | TallyError::Scoring { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels_are_stable() {
        assert_eq!(
            TallyError::PolicyViolation("x".into()).kind(),
            "policy_violation"
        );
        assert_eq!(
            TallyError::Planning {
                reason: "r".into(),
                generated: "DROP TABLE t".into()
            }
            .kind(),
            "planning_error"
        );
        assert_eq!(TallyError::Execution("t".into()).kind(), "execution_error");
        assert_eq!(TallyError::Tool("t".into()).kind(), "tool_error");
    }

    #[test]
    fn test_planning_error_carries_generated_text() {
        let e = TallyError::Planning {
            reason: "mutation keyword".into(),
            generated: "DELETE FROM approved_tickets".into(),
        };
        assert!(e.to_string().contains("DELETE FROM approved_tickets"));
    }

    #[test]
    fn test_only_tool_and_scoring_are_recoverable() {
        assert!(TallyError::Tool("down".into()).is_recoverable());
        assert!(TallyError::Scoring {
            metric: "faithfulness".into(),
            reason: "judge timeout".into()
        }
        .is_recoverable());
        assert!(!TallyError::Execution("timeout".into()).is_recoverable());
        assert!(!TallyError::PolicyViolation("bad".into()).is_recoverable());
    }
}
