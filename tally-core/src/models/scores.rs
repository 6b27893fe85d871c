use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::run::MetricFamily;

/// RAGAS-style scores for one answered question. Each metric is in [0,1]
/// when scored, `None` when not applicable or when its scoring failed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RagScores {
    pub faithfulness: Option<f64>,
    pub answer_relevance: Option<f64>,
    pub context_precision: Option<f64>,
    pub context_recall: Option<f64>,
}

impl RagScores {
    pub fn metric_values(&self) -> Vec<(&'static str, Option<f64>)> {
        vec![
            ("faithfulness", self.faithfulness),
            ("answer_relevance", self.answer_relevance),
            ("context_precision", self.context_precision),
            ("context_recall", self.context_recall),
        ]
    }
}

/// Ingestion-quality scores for one ticket: deterministic field matches,
/// item-matching precision/recall/F1, and judge similarity scores.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestionScores {
    pub merchant_match: bool,
    pub date_match: bool,
    pub amount_match: bool,
    pub item_precision: Option<f64>,
    pub item_recall: Option<f64>,
    pub item_f1: Option<f64>,
    pub merchant_similarity: Option<f64>,
    pub items_similarity: Option<f64>,
    pub overall_quality: Option<f64>,
    #[serde(default)]
    pub feedback: Option<String>,
}

impl IngestionScores {
    /// Numeric view used for run-level averaging; booleans become 0/1 rates.
    pub fn metric_values(&self) -> Vec<(&'static str, Option<f64>)> {
        vec![
            ("merchant_match", Some(bool_score(self.merchant_match))),
            ("date_match", Some(bool_score(self.date_match))),
            ("amount_match", Some(bool_score(self.amount_match))),
            ("item_precision", self.item_precision),
            ("item_recall", self.item_recall),
            ("item_f1", self.item_f1),
            ("merchant_similarity", self.merchant_similarity),
            ("items_similarity", self.items_similarity),
            ("overall_quality", self.overall_quality),
        ]
    }
}

fn bool_score(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

/// Family-tagged score payload stored in one `scores` column.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum MetricScores {
    Rag(RagScores),
    Ingestion(IngestionScores),
}

impl MetricScores {
    pub fn family(&self) -> MetricFamily {
        match self {
            MetricScores::Rag(_) => MetricFamily::Rag,
            MetricScores::Ingestion(_) => MetricFamily::Ingestion,
        }
    }

    pub fn metric_values(&self) -> Vec<(&'static str, Option<f64>)> {
        match self {
            MetricScores::Rag(s) => s.metric_values(),
            MetricScores::Ingestion(s) => s.metric_values(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failed,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Success => "success",
            ResultStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(ResultStatus::Success),
            "failed" => Some(ResultStatus::Failed),
            _ => None,
        }
    }
}

/// One scored constituent of a run. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub id: i32,
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
    pub created_at: DateTime<Utc>,
}
