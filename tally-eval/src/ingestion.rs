//! Ingestion metric family — extracted ticket fields vs. admin ground truth
//!
//! Deterministic metrics are pure functions of the two inputs (idempotent by
//! construction): exact-match booleans for merchant/date/amount and a greedy
//! item matching that yields precision/recall/F1. Judge metrics add semantic
//! similarity scores with deterministic fallbacks when the judge is down.
//!
//! Edge policy for item matching (applied consistently):
//! - no extracted and no ground-truth items: trivially complete, all 1.0
//! - no extracted but ground-truth items exist: recall 0, precision
//!   not-applicable
//! - extracted items but no ground truth: precision 0, recall not-applicable

use std::sync::Arc;

use serde::Deserialize;
use sqlx::PgPool;

use tally_core::{
    GenerativeBackend, GroundTruthRecord, IngestionScores, LineItem, TallyError, Ticket,
};

/// Amounts within one cent count as equal.
const AMOUNT_TOLERANCE: f64 = 0.01;

const MERCHANT_SYSTEM: &str = "\
You evaluate extraction quality. Compare two merchant names and rate their \
similarity: case differences and minor OCR errors score high, different \
merchants score low. Respond with ONLY a number between 0.0 and 1.0, \
nothing else.";

const MERCHANT_USER: &str = "\
Expected merchant name: \"{expected}\"
Actual extracted name: \"{actual}\"";

const ITEMS_SYSTEM: &str = "\
You evaluate extraction quality. Compare the expected items with the actual \
extracted items: descriptions may carry minor OCR errors but convey the same \
meaning, prices should match closely, missing or extra items reduce the \
score. Respond with ONLY a number between 0.0 and 1.0, nothing else.";

const ITEMS_USER: &str = "\
Expected items:
{expected}

Actual extracted items:
{actual}";

const OVERALL_SYSTEM: &str = "\
You evaluate extraction quality for a receipt. Compare the expected data \
with the actual extracted data and respond with ONLY a JSON object \
{\"score\": <0.0 to 1.0>, \"feedback\": \"<brief assessment>\"}, nothing else.";

const OVERALL_USER: &str = "\
Expected:
{expected}

Actual:
{actual}";

// ============================================================================
// Deterministic metrics
// ============================================================================

/// Case- and whitespace-insensitive text match; two absent values match.
pub fn exact_match_text(expected: Option<&str>, actual: Option<&str>) -> bool {
    match (expected, actual) {
        (None, None) => true,
        (Some(e), Some(a)) => e.trim().to_lowercase() == a.trim().to_lowercase(),
        _ => false,
    }
}

/// Date match on the canonical string form.
pub fn exact_match_date(expected: Option<&str>, actual: Option<&str>) -> bool {
    match (expected, actual) {
        (None, None) => true,
        (Some(e), Some(a)) => e.trim() == a.trim(),
        _ => false,
    }
}

/// Amount match within one cent.
pub fn exact_match_amount(expected: Option<f64>, actual: Option<f64>) -> bool {
    match (expected, actual) {
        (None, None) => true,
        (Some(e), Some(a)) => (e - a).abs() < AMOUNT_TOLERANCE,
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ItemMatchMetrics {
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub f1: Option<f64>,
}

fn items_match(expected: &LineItem, actual: &LineItem) -> bool {
    let e = expected.description.trim().to_lowercase();
    let a = actual.description.trim().to_lowercase();
    let description_match = e == a || e.contains(&a) || a.contains(&e);
    description_match && (expected.price - actual.price).abs() < AMOUNT_TOLERANCE
}

/// Greedy one-to-one matching between ground-truth and extracted items.
/// Pure function of the two lists.
pub fn item_match_metrics(expected: &[LineItem], actual: &[LineItem]) -> ItemMatchMetrics {
    if expected.is_empty() && actual.is_empty() {
        return ItemMatchMetrics {
            precision: Some(1.0),
            recall: Some(1.0),
            f1: Some(1.0),
        };
    }
    if actual.is_empty() {
        return ItemMatchMetrics {
            precision: None,
            recall: Some(0.0),
            f1: None,
        };
    }
    if expected.is_empty() {
        return ItemMatchMetrics {
            precision: Some(0.0),
            recall: None,
            f1: None,
        };
    }

    let mut matched_actual = vec![false; actual.len()];
    let mut true_positives = 0usize;

    for expected_item in expected {
        for (idx, actual_item) in actual.iter().enumerate() {
            if matched_actual[idx] {
                continue;
            }
            if items_match(expected_item, actual_item) {
                matched_actual[idx] = true;
                true_positives += 1;
                break;
            }
        }
    }

    let precision = true_positives as f64 / actual.len() as f64;
    let recall = true_positives as f64 / expected.len() as f64;
    let f1 = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };

    ItemMatchMetrics {
        precision: Some(precision),
        recall: Some(recall),
        f1: Some(f1),
    }
}

// ============================================================================
// Judge metrics
// ============================================================================

#[derive(Debug, Deserialize)]
struct OverallReply {
    score: f64,
    #[serde(default)]
    feedback: String,
}

pub struct IngestionEvaluator {
    judge: Arc<dyn GenerativeBackend>,
}

impl IngestionEvaluator {
    pub fn new(judge: Arc<dyn GenerativeBackend>) -> Self {
        Self { judge }
    }

    /// Fetch the extracted ticket and score it against the ground truth.
    pub async fn evaluate_ticket(
        &self,
        pool: &PgPool,
        ground_truth: &GroundTruthRecord,
    ) -> Result<IngestionScores, TallyError> {
        let ticket = fetch_ticket(pool, ground_truth.ticket_id).await?;
        Ok(self.score_ticket(ground_truth, &ticket).await)
    }

    /// Score already-fetched fields. Deterministic metrics never fail;
    /// judge metrics fall back deterministically when the judge is down.
    pub async fn score_ticket(
        &self,
        ground_truth: &GroundTruthRecord,
        ticket: &Ticket,
    ) -> IngestionScores {
        let actual_date = ticket.transaction_date.map(|d| d.to_string());

        let merchant_match = exact_match_text(
            ground_truth.merchant_name.as_deref(),
            ticket.merchant_name.as_deref(),
        );
        let date_match = exact_match_date(
            ground_truth.transaction_date.as_deref(),
            actual_date.as_deref(),
        );
        let amount_match =
            exact_match_amount(ground_truth.total_amount, ticket.total_amount);

        let items = item_match_metrics(&ground_truth.items, &ticket.items);

        let merchant_similarity = self
            .merchant_similarity(
                ground_truth.merchant_name.as_deref().unwrap_or(""),
                ticket.merchant_name.as_deref().unwrap_or(""),
            )
            .await;
        let items_similarity = self
            .items_similarity(&ground_truth.items, &ticket.items, items.f1)
            .await;
        let (overall_quality, feedback) = self.overall_quality(ground_truth, ticket).await;

        IngestionScores {
            merchant_match,
            date_match,
            amount_match,
            item_precision: items.precision,
            item_recall: items.recall,
            item_f1: items.f1,
            merchant_similarity,
            items_similarity,
            overall_quality,
            feedback,
        }
    }

    async fn merchant_similarity(&self, expected: &str, actual: &str) -> Option<f64> {
        let user = MERCHANT_USER
            .replace("{expected}", expected)
            .replace("{actual}", actual);

        match self.judge.generate(MERCHANT_SYSTEM, &user).await {
            Ok(generation) => match crate::rag::parse_unit_score(&generation.text) {
                Ok(score) => Some(score),
                Err(reason) => {
                    tracing::warn!(reason, "Merchant similarity judge reply unusable; falling back to exact compare");
                    Some(fallback_similarity(expected, actual))
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Merchant similarity judge failed; falling back to exact compare");
                Some(fallback_similarity(expected, actual))
            }
        }
    }

    async fn items_similarity(
        &self,
        expected: &[LineItem],
        actual: &[LineItem],
        deterministic_f1: Option<f64>,
    ) -> Option<f64> {
        let user = ITEMS_USER
            .replace("{expected}", &items_json(expected))
            .replace("{actual}", &items_json(actual));

        match self.judge.generate(ITEMS_SYSTEM, &user).await {
            Ok(generation) => match crate::rag::parse_unit_score(&generation.text) {
                Ok(score) => Some(score),
                Err(reason) => {
                    tracing::warn!(reason, "Items similarity judge reply unusable; falling back to deterministic F1");
                    deterministic_f1
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Items similarity judge failed; falling back to deterministic F1");
                deterministic_f1
            }
        }
    }

    async fn overall_quality(
        &self,
        ground_truth: &GroundTruthRecord,
        ticket: &Ticket,
    ) -> (Option<f64>, Option<String>) {
        let expected = serde_json::to_string_pretty(ground_truth).unwrap_or_default();
        let actual = serde_json::to_string_pretty(ticket).unwrap_or_default();

        let user = OVERALL_USER
            .replace("{expected}", &expected)
            .replace("{actual}", &actual);

        match self.judge.generate(OVERALL_SYSTEM, &user).await {
            Ok(generation) => {
                match serde_json::from_str::<OverallReply>(strip_fences(&generation.text)) {
                    Ok(reply) => (
                        Some(reply.score.clamp(0.0, 1.0)),
                        Some(reply.feedback),
                    ),
                    Err(e) => {
                        tracing::warn!(error = %e, "Overall quality judge reply unusable");
                        (Some(0.5), Some("evaluation error occurred".to_string()))
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Overall quality judge failed");
                (Some(0.5), Some("evaluation error occurred".to_string()))
            }
        }
    }
}

fn fallback_similarity(expected: &str, actual: &str) -> f64 {
    if expected.trim().to_lowercase() == actual.trim().to_lowercase() {
        1.0
    } else {
        0.0
    }
}

fn items_json(items: &[LineItem]) -> String {
    serde_json::to_string_pretty(items).unwrap_or_else(|_| "[]".to_string())
}

fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}

/// Read one extracted ticket row. The evaluation engine reads tickets, it
/// never writes them.
pub async fn fetch_ticket(pool: &PgPool, ticket_id: i64) -> Result<Ticket, TallyError> {
    let row: Option<(
        i64,
        Option<String>,
        Option<chrono::NaiveDate>,
        Option<f64>,
        Option<serde_json::Value>,
        Option<String>,
    )> = sqlx::query_as(
        "SELECT id, merchant_name, transaction_date, total_amount::float8, items, category \
         FROM tickets WHERE id = $1",
    )
    .bind(ticket_id)
    .fetch_optional(pool)
    .await?;

    let (id, merchant_name, transaction_date, total_amount, items, category) =
        row.ok_or_else(|| TallyError::Other(format!("ticket {ticket_id} not found")))?;

    let items = items
        .map(|value| {
            serde_json::from_value::<Vec<LineItem>>(value).unwrap_or_else(|e| {
                tracing::warn!(ticket_id, error = %e, "Ticket items column is not a line-item array");
                Vec::new()
            })
        })
        .unwrap_or_default();

    Ok(Ticket {
        id,
        merchant_name,
        transaction_date,
        total_amount,
        items,
        category,
    })
}

// ============================================================================
// TESTS
// ============================================================================
