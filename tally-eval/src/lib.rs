pub mod aggregate;
pub mod dataset;
pub mod ingestion;
pub mod rag;
pub mod runner;
pub mod store;

pub use aggregate::{MetricsSummary, MetricsTrends};
pub use dataset::{EvalQuery, QuerySet};
pub use ingestion::IngestionEvaluator;
pub use rag::RagEvaluator;
pub use runner::{AnswerSource, EvaluationRunner, RunSummary};
pub use store::{EvaluationStore, NewResult};
