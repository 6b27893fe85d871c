pub mod config;
pub mod db;
pub mod error;
pub mod ipc;
pub mod llm;
pub mod models;
pub mod search;

pub use config::TallyConfig;
pub use error::TallyError;
pub use llm::{ChatClient, Generation, GenerativeBackend, LlmError, ScriptedBackend};
pub use models::answer::Answer;
pub use models::context::{ContextFragment, ContextSource, RetrievedContext, NO_RECORDS_MARKER};
pub use models::query::GeneratedQuery;
pub use models::question::Question;
pub use models::run::{EvaluationRun, MetricFamily, RunStatus, RunType};
pub use models::scores::{
    EvaluationResult, IngestionScores, MetricScores, RagScores, ResultStatus,
};
pub use models::ticket::{GroundTruthRecord, LineItem, Ticket};
pub use search::{SearchClient, SearchError, SearchHit};
