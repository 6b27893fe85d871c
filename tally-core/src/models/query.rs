use serde::{Deserialize, Serialize};

/// A validated, schema-bound statement produced by the planner.
/// Immutable once constructed; only ever runs against the approved view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedQuery {
    pub sql: String,
    /// Natural-language restatement of what the statement retrieves,
    /// kept for audit logging.
    pub intent: String,
    /// The question that produced this statement.
    pub question: String,
}
