use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which scoring strategy a run applies. One lifecycle, two metric families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricFamily {
    Rag,
    Ingestion,
}

impl MetricFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricFamily::Rag => "rag",
            MetricFamily::Ingestion => "ingestion",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rag" => Some(MetricFamily::Rag),
            "ingestion" => Some(MetricFamily::Ingestion),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Manual,
    Sample,
    Full,
    Realtime,
    Scheduled,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::Manual => "manual",
            RunType::Sample => "sample",
            RunType::Full => "full",
            RunType::Realtime => "realtime",
            RunType::Scheduled => "scheduled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(RunType::Manual),
            "sample" => Some(RunType::Sample),
            "full" => Some(RunType::Full),
            "realtime" => Some(RunType::Realtime),
            "scheduled" => Some(RunType::Scheduled),
            _ => None,
        }
    }
}

/// Run lifecycle: pending -> running -> completed | aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "aborted" => Some(RunStatus::Aborted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Aborted)
    }
}

/// One evaluation invocation, batch or realtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRun {
    pub run_id: Uuid,
    pub metric_family: MetricFamily,
    pub run_type: RunType,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_queries: Option<i32>,
    pub successful_queries: Option<i32>,
    /// Per-metric averages over successfully scored constituents,
    /// keyed by metric name.
    pub averages: serde_json::Value,
    pub metadata: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Aborted,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("bogus"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Aborted.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
    }
}
