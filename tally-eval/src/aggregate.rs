//! Metrics aggregator — read-only rollups over persisted runs and results
//!
//! Pure queries plus in-memory averaging; nothing here writes.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use tally_core::{EvaluationRun, MetricFamily, TallyError};

use crate::store::EvaluationStore;

#[derive(Debug, Serialize)]
pub struct MetricsSummary {
    pub metric_family: MetricFamily,
    pub latest_run_id: Option<Uuid>,
    pub latest_run_date: Option<DateTime<Utc>>,
    pub total_evaluations: i64,
    pub successful_evaluations: i64,
    /// Percentage of constituents that scored successfully.
    pub success_rate: f64,
    pub latest_averages: HashMap<String, f64>,
    pub overall_averages: HashMap<String, f64>,
    pub avg_response_time_ms: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct TrendPoint {
    pub date: DateTime<Utc>,
    pub run_id: Uuid,
    pub averages: HashMap<String, f64>,
    pub total_queries: Option<i32>,
    pub successful_queries: Option<i32>,
    pub success_rate: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct MetricsTrends {
    pub metric_family: MetricFamily,
    pub period_days: i64,
    pub data_points: Vec<TrendPoint>,
}

/// Summary statistics over all completed runs of one family.
pub async fn summary(
    store: &EvaluationStore,
    family: MetricFamily,
) -> Result<MetricsSummary, TallyError> {
    let latest = store.latest_completed_run(family).await?;
    let completed = store
        .completed_runs_since(family, DateTime::UNIX_EPOCH)
        .await?;

    let mut total_evaluations: i64 = 0;
    let mut successful_evaluations: i64 = 0;
    let mut per_metric: HashMap<String, Vec<f64>> = HashMap::new();

    for run in &completed {
        total_evaluations += run.total_queries.unwrap_or(0) as i64;
        successful_evaluations += run.successful_queries.unwrap_or(0) as i64;
        for (metric, value) in averages_map(&run.averages) {
            per_metric.entry(metric).or_default().push(value);
        }
    }

    let success_rate = if total_evaluations > 0 {
        successful_evaluations as f64 / total_evaluations as f64 * 100.0
    } else {
        0.0
    };

    let overall_averages = per_metric
        .into_iter()
        .map(|(metric, values)| {
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            (metric, mean)
        })
        .collect();

    let avg_response_time_ms = store.avg_response_time_ms(family).await?;

    Ok(MetricsSummary {
        metric_family: family,
        latest_run_id: latest.as_ref().map(|r| r.run_id),
        latest_run_date: latest.as_ref().and_then(|r| r.completed_at),
        total_evaluations,
        successful_evaluations,
        success_rate,
        latest_averages: latest
            .as_ref()
            .map(|r| averages_map(&r.averages))
            .unwrap_or_default(),
        overall_averages,
        avg_response_time_ms,
    })
}

/// Time-ordered trend series over the last `days` days.
pub async fn trends(
    store: &EvaluationStore,
    family: MetricFamily,
    days: i64,
) -> Result<MetricsTrends, TallyError> {
    let cutoff = Utc::now() - Duration::days(days);
    let runs = store.completed_runs_since(family, cutoff).await?;

    let data_points = runs.iter().map(trend_point).collect();

    Ok(MetricsTrends {
        metric_family: family,
        period_days: days,
        data_points,
    })
}

fn trend_point(run: &EvaluationRun) -> TrendPoint {
    let success_rate = match (run.total_queries, run.successful_queries) {
        (Some(total), Some(successful)) if total > 0 => {
            Some(successful as f64 / total as f64 * 100.0)
        }
        _ => None,
    };

    TrendPoint {
        date: run.completed_at.unwrap_or(run.started_at),
        run_id: run.run_id,
        averages: averages_map(&run.averages),
        total_queries: run.total_queries,
        successful_queries: run.successful_queries,
        success_rate,
    }
}

/// Flatten a stored averages object to finite numbers only.
pub fn averages_map(averages: &serde_json::Value) -> HashMap<String, f64> {
    averages
        .as_object()
        .map(|fields| {
            fields
                .iter()
                .filter_map(|(metric, value)| {
                    value
                        .as_f64()
                        .filter(|v| v.is_finite())
                        .map(|v| (metric.clone(), v))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{RunStatus, RunType};

    fn run_with(averages: serde_json::Value, total: i32, successful: i32) -> EvaluationRun {
        EvaluationRun {
            run_id: Uuid::new_v4(),
            metric_family: MetricFamily::Rag,
            run_type: RunType::Full,
            status: RunStatus::Completed,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            total_queries: Some(total),
            successful_queries: Some(successful),
            averages,
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn test_averages_map_drops_non_numeric_values() {
        let map = averages_map(&serde_json::json!({
            "faithfulness": 0.9,
            "note": "not a number",
            "context_recall": null
        }));
        assert_eq!(map.len(), 1);
        assert_eq!(map["faithfulness"], 0.9);
    }

    #[test]
    fn test_trend_point_success_rate() {
        let point = trend_point(&run_with(serde_json::json!({"faithfulness": 0.8}), 10, 8));
        assert_eq!(point.success_rate, Some(80.0));
        assert_eq!(point.averages["faithfulness"], 0.8);

        let empty = trend_point(&run_with(serde_json::json!({}), 0, 0));
        assert_eq!(empty.success_rate, None);
    }
}
