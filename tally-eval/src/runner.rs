//! Evaluation runner — one run lifecycle for both metric families
//!
//! pending -> running -> completed | aborted, written once and driven by a
//! family-tagged scoring strategy. Batch runs score a fixed query set with
//! bounded concurrency; realtime runs wrap a single item. Per-item failures
//! become failed result rows and never sink the run; cancellation aborts
//! the run while keeping every result already written.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tally_core::config::EvaluationConfig;
use tally_core::{
    Answer, GroundTruthRecord, MetricFamily, MetricScores, RagScores, ResultStatus, RunStatus,
    RunType, TallyError,
};

use crate::dataset::{EvalQuery, QuerySet};
use crate::ingestion::IngestionEvaluator;
use crate::rag::RagEvaluator;
use crate::store::{EvaluationStore, NewResult};

/// Capability the runner needs from the query pipeline: answer one question.
/// Keeps the evaluation engine independent of the pipeline implementation
/// and unit-testable with a canned source.
#[async_trait]
pub trait AnswerSource: Send + Sync {
    async fn answer(&self, question: &str) -> Result<Answer, TallyError>;
}

/// What one finished run looks like to the caller.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub total_queries: usize,
    pub successful_queries: usize,
    pub averages: serde_json::Value,
}

/// Outcome of scoring one constituent item.
struct ItemOutcome {
    success: bool,
    scores: Option<MetricScores>,
}

pub struct EvaluationRunner {
    store: EvaluationStore,
    rag: RagEvaluator,
    ingestion: IngestionEvaluator,
    source: Arc<dyn AnswerSource>,
    config: EvaluationConfig,
}

impl EvaluationRunner {
    pub fn new(
        store: EvaluationStore,
        rag: RagEvaluator,
        ingestion: IngestionEvaluator,
        source: Arc<dyn AnswerSource>,
        config: EvaluationConfig,
    ) -> Self {
        Self {
            store,
            rag,
            ingestion,
            source,
            config,
        }
    }

    /// Create and immediately execute a batch run.
    pub async fn run_batch(
        &self,
        run_type: RunType,
        sample_size: Option<u32>,
        cancel: CancellationToken,
    ) -> Result<RunSummary, TallyError> {
        let run = self.store.create_run(MetricFamily::Rag, run_type).await?;
        self.execute_batch(run.run_id, run_type, sample_size, cancel)
            .await
    }

    /// Create the run row only, so callers can hand out the run id before
    /// the (long) execution starts in the background.
    pub async fn create_batch_run(&self, run_type: RunType) -> Result<Uuid, TallyError> {
        let run = self.store.create_run(MetricFamily::Rag, run_type).await?;
        Ok(run.run_id)
    }

    /// Run the fixed query set through the pipeline and score every answer.
    /// A dataset load failure aborts the run (systemic, not per-item).
    pub async fn execute_batch(
        &self,
        run_id: Uuid,
        run_type: RunType,
        sample_size: Option<u32>,
        cancel: CancellationToken,
    ) -> Result<RunSummary, TallyError> {
        let dataset = match QuerySet::load(&self.config.dataset_path) {
            Ok(dataset) => dataset,
            Err(e) => {
                self.store
                    .abort_run(run_id, &format!("dataset unavailable: {e}"))
                    .await?;
                return Err(TallyError::RunAbort(format!("dataset unavailable: {e}")));
            }
        };
        let queries = match run_type {
            RunType::Sample => {
                dataset.sample(sample_size.unwrap_or(self.config.sample_size) as usize)
            }
            _ => dataset.queries.clone(),
        };

        let total = queries.len();

        tracing::info!(%run_id, run_type = run_type.as_str(), total, "Starting evaluation run");
        self.store.mark_running(run_id).await?;

        let concurrency = self.config.max_concurrent_scorings.max(1) as usize;

        let outcomes: Vec<Option<ItemOutcome>> = stream::iter(queries)
            .map(|query| {
                let cancel = cancel.clone();
                async move {
                    tokio::select! {
                        _ = cancel.cancelled() => None,
                        outcome = self.score_query(run_id, &query) => Some(outcome),
                    }
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let scored: Vec<ItemOutcome> = outcomes.into_iter().flatten().collect();
        let successful = scored.iter().filter(|o| o.success).count();
        let averages = averages_over(scored.iter().filter_map(|o| o.scores.as_ref()));

        let status = if cancel.is_cancelled() {
            self.store.abort_run(run_id, "operator cancellation").await?;
            self.store
                .complete_run(run_id, RunStatus::Aborted, total as i32, successful as i32, averages.clone())
                .await?;
            tracing::warn!(%run_id, scored = scored.len(), total, "Evaluation run aborted; partial results retained");
            RunStatus::Aborted
        } else {
            self.store
                .complete_run(run_id, RunStatus::Completed, total as i32, successful as i32, averages.clone())
                .await?;
            tracing::info!(%run_id, successful, total, "Evaluation run completed");
            RunStatus::Completed
        };

        Ok(RunSummary {
            run_id,
            status,
            total_queries: total,
            successful_queries: successful,
            averages,
        })
    }

    /// Score one live question as a single-item realtime run.
    pub async fn run_realtime(
        &self,
        question: &str,
        reference_answer: Option<&str>,
    ) -> Result<(RunSummary, RagScores), TallyError> {
        let run = self
            .store
            .create_run(MetricFamily::Rag, RunType::Realtime)
            .await?;
        let run_id = run.run_id;
        self.store.mark_running(run_id).await?;

        let query = EvalQuery {
            query_id: format!("realtime_{run_id}"),
            question: question.to_string(),
            reference_answer: reference_answer.map(String::from),
        };

        let outcome = self.score_query(run_id, &query).await;
        let successful = usize::from(outcome.success);
        let averages = averages_over(outcome.scores.iter());

        self.store
            .complete_run(run_id, RunStatus::Completed, 1, successful as i32, averages.clone())
            .await?;

        let scores = match outcome.scores {
            Some(MetricScores::Rag(scores)) => scores,
            _ => RagScores::default(),
        };

        Ok((
            RunSummary {
                run_id,
                status: RunStatus::Completed,
                total_queries: 1,
                successful_queries: successful,
                averages,
            },
            scores,
        ))
    }

    /// Score an answer the pipeline already produced, without re-asking.
    /// Used by ask-with-evaluation so the caller's answer and the scored
    /// answer are the same text.
    pub async fn run_realtime_for_answer(
        &self,
        question: &str,
        answer: &Answer,
        reference_answer: Option<&str>,
    ) -> Result<(RunSummary, RagScores), TallyError> {
        let run = self
            .store
            .create_run(MetricFamily::Rag, RunType::Realtime)
            .await?;
        let run_id = run.run_id;
        self.store.mark_running(run_id).await?;

        let (scores, metric_errors) = self
            .rag
            .score_answer(question, &answer.text, &answer.context, reference_answer)
            .await;

        let status = if metric_errors.is_empty() {
            ResultStatus::Success
        } else {
            ResultStatus::Failed
        };
        let tagged = MetricScores::Rag(scores.clone());

        self.store
            .insert_result(NewResult {
                run_id,
                item_id: format!("realtime_{run_id}"),
                question: question.to_string(),
                generated_answer: Some(answer.text.clone()),
                retrieved_context: Some(answer.context.render()),
                reference_answer: reference_answer.map(String::from),
                scores: tagged.clone(),
                response_time_ms: Some(answer.latency_ms as i32),
                token_count: Some(answer.token_count() as i32),
                status,
                error_message: if metric_errors.is_empty() {
                    None
                } else {
                    Some(metric_errors.join("; "))
                },
            })
            .await?;

        let successful = i32::from(status == ResultStatus::Success);
        let averages = averages_over(std::iter::once(&tagged));

        self.store
            .complete_run(run_id, RunStatus::Completed, 1, successful, averages.clone())
            .await?;

        Ok((
            RunSummary {
                run_id,
                status: RunStatus::Completed,
                total_queries: 1,
                successful_queries: successful as usize,
                averages,
            },
            scores,
        ))
    }

    /// Score one ticket against ground truth as a single-item realtime run.
    pub async fn run_ingestion_realtime(
        &self,
        ground_truth: &GroundTruthRecord,
    ) -> Result<(RunSummary, MetricScores), TallyError> {
        let run = self
            .store
            .create_run(MetricFamily::Ingestion, RunType::Realtime)
            .await?;
        let run_id = run.run_id;
        self.store.mark_running(run_id).await?;

        let (scores, status, error_message) = match self
            .ingestion
            .evaluate_ticket(self.store.pool(), ground_truth)
            .await
        {
            Ok(scores) => (
                MetricScores::Ingestion(scores),
                ResultStatus::Success,
                None,
            ),
            Err(e) => {
                tracing::error!(ticket_id = ground_truth.ticket_id, error = %e, "Ingestion scoring failed");
                (
                    MetricScores::Ingestion(Default::default()),
                    ResultStatus::Failed,
                    Some(e.to_string()),
                )
            }
        };

        self.store
            .insert_result(NewResult {
                run_id,
                item_id: ground_truth.ticket_id.to_string(),
                question: format!("ingestion quality for ticket {}", ground_truth.ticket_id),
                generated_answer: None,
                retrieved_context: None,
                reference_answer: None,
                scores: scores.clone(),
                response_time_ms: None,
                token_count: None,
                status,
                error_message,
            })
            .await?;

        let successful = i32::from(status == ResultStatus::Success);
        let averages = if status == ResultStatus::Success {
            averages_over(std::iter::once(&scores))
        } else {
            serde_json::json!({})
        };

        self.store
            .complete_run(run_id, RunStatus::Completed, 1, successful, averages.clone())
            .await?;

        Ok((
            RunSummary {
                run_id,
                status: RunStatus::Completed,
                total_queries: 1,
                successful_queries: successful as usize,
                averages,
            },
            scores,
        ))
    }

    /// Answer and score one query; any failure becomes a failed result row.
    async fn score_query(&self, run_id: Uuid, query: &EvalQuery) -> ItemOutcome {
        let deadline = Duration::from_secs(self.config.scoring_timeout_seconds);
        let started = Instant::now();

        let scored = tokio::time::timeout(deadline, self.answer_and_score(query)).await;
        let response_time_ms = started.elapsed().as_millis() as i32;

        let (result, outcome) = match scored {
            Ok(Ok((answer, scores, metric_errors))) => {
                let status = if metric_errors.is_empty() {
                    ResultStatus::Success
                } else {
                    ResultStatus::Failed
                };
                let error_message = if metric_errors.is_empty() {
                    None
                } else {
                    Some(metric_errors.join("; "))
                };
                let scores = MetricScores::Rag(scores);
                (
                    NewResult {
                        run_id,
                        item_id: query.query_id.clone(),
                        question: query.question.clone(),
                        generated_answer: Some(answer.text.clone()),
                        retrieved_context: Some(answer.context.render()),
                        reference_answer: query.reference_answer.clone(),
                        scores: scores.clone(),
                        response_time_ms: Some(response_time_ms),
                        token_count: Some(answer.token_count() as i32),
                        status,
                        error_message,
                    },
                    ItemOutcome {
                        success: status == ResultStatus::Success,
                        scores: Some(scores),
                    },
                )
            }
            Ok(Err(e)) => {
                tracing::error!(query_id = %query.query_id, error = %e, "Query evaluation failed");
                (
                    failed_result(run_id, query, response_time_ms, e.to_string()),
                    ItemOutcome {
                        success: false,
                        scores: None,
                    },
                )
            }
            Err(_) => {
                let message = format!(
                    "scoring exceeded timeout of {}s",
                    self.config.scoring_timeout_seconds
                );
                tracing::error!(query_id = %query.query_id, "{message}");
                (
                    failed_result(run_id, query, response_time_ms, message),
                    ItemOutcome {
                        success: false,
                        scores: None,
                    },
                )
            }
        };

        if let Err(e) = self.store.insert_result(result).await {
            tracing::error!(query_id = %query.query_id, error = %e, "Failed to persist evaluation result");
        }

        outcome
    }

    async fn answer_and_score(
        &self,
        query: &EvalQuery,
    ) -> Result<(Answer, RagScores, Vec<String>), TallyError> {
        let answer = self.source.answer(&query.question).await?;

        let (scores, metric_errors) = self
            .rag
            .score_answer(
                &query.question,
                &answer.text,
                &answer.context,
                query.reference_answer.as_deref(),
            )
            .await;

        Ok((answer, scores, metric_errors))
    }
}

fn failed_result(
    run_id: Uuid,
    query: &EvalQuery,
    response_time_ms: i32,
    error_message: String,
) -> NewResult {
    NewResult {
        run_id,
        item_id: query.query_id.clone(),
        question: query.question.clone(),
        generated_answer: None,
        retrieved_context: None,
        reference_answer: query.reference_answer.clone(),
        scores: MetricScores::Rag(RagScores::default()),
        response_time_ms: Some(response_time_ms),
        token_count: None,
        status: ResultStatus::Failed,
        error_message: Some(error_message),
    }
}

/// Per-metric averages over the scored items that produced a value for
/// that metric. Metrics with no values are omitted.
pub fn averages_over<'a>(scores: impl Iterator<Item = &'a MetricScores>) -> serde_json::Value {
    let mut buckets: HashMap<&'static str, Vec<f64>> = HashMap::new();

    for item in scores {
        for (metric, value) in item.metric_values() {
            if let Some(v) = value {
                if v.is_finite() {
                    buckets.entry(metric).or_default().push(v);
                }
            }
        }
    }

    let mut averages = serde_json::Map::new();
    for (metric, values) in buckets {
        if !values.is_empty() {
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            averages.insert(metric.to_string(), serde_json::json!(mean));
        }
    }

    serde_json::Value::Object(averages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_averages_skip_missing_metrics() {
        let items = vec![
            MetricScores::Rag(RagScores {
                faithfulness: Some(1.0),
                answer_relevance: Some(0.5),
                context_precision: Some(1.0),
                context_recall: None,
            }),
            MetricScores::Rag(RagScores {
                faithfulness: Some(0.5),
                answer_relevance: Some(0.5),
                context_precision: None,
                context_recall: None,
            }),
        ];

        let averages = averages_over(items.iter());
        assert_eq!(averages["faithfulness"], 0.75);
        assert_eq!(averages["answer_relevance"], 0.5);
        assert_eq!(averages["context_precision"], 1.0);
        assert!(
            averages.get("context_recall").is_none(),
            "metric with no values must be omitted, not defaulted"
        );
    }

    #[test]
    fn test_averages_of_nothing_is_empty_object() {
        let averages = averages_over(std::iter::empty());
        assert_eq!(averages, serde_json::json!({}));
    }

    #[test]
    fn test_ingestion_booleans_average_to_rates() {
        let items = vec![
            MetricScores::Ingestion(tally_core::IngestionScores {
                merchant_match: true,
                date_match: true,
                amount_match: false,
                item_f1: Some(1.0),
                ..Default::default()
            }),
            MetricScores::Ingestion(tally_core::IngestionScores {
                merchant_match: false,
                date_match: true,
                amount_match: false,
                item_f1: Some(0.5),
                ..Default::default()
            }),
        ];

        let averages = averages_over(items.iter());
        assert_eq!(averages["merchant_match"], 0.5);
        assert_eq!(averages["date_match"], 1.0);
        assert_eq!(averages["amount_match"], 0.0);
        assert_eq!(averages["item_f1"], 0.75);
    }
}
