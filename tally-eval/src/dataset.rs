//! Fixed evaluation query sets, loaded from a JSON dataset file.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tally_core::TallyError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalQuery {
    pub query_id: String,
    pub question: String,
    #[serde(default)]
    pub reference_answer: Option<String>,
}

#[derive(Debug, Clone)]
pub struct QuerySet {
    pub queries: Vec<EvalQuery>,
}

impl QuerySet {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TallyError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let queries: Vec<EvalQuery> = serde_json::from_str(&raw).map_err(|e| {
            TallyError::Other(format!("invalid query dataset {}: {e}", path.display()))
        })?;
        Ok(Self { queries })
    }

    /// First `count` queries, for sample runs.
    pub fn sample(&self, count: usize) -> Vec<EvalQuery> {
        self.queries.iter().take(count).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_dataset(name: &str, content: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_and_sample() {
        let path = write_dataset(
            "tally_dataset_ok.json",
            r#"[
                {"query_id": "q1", "question": "total spend?", "reference_answer": "42.00"},
                {"query_id": "q2", "question": "top merchant?"}
            ]"#,
        );

        let set = QuerySet::load(&path).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.queries[0].reference_answer.as_deref(), Some("42.00"));
        assert_eq!(set.queries[1].reference_answer, None);
        assert_eq!(set.sample(1).len(), 1);
        assert_eq!(set.sample(10).len(), 2);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let path = write_dataset("tally_dataset_bad.json", "{not json");
        assert!(QuerySet::load(&path).is_err());
    }

    #[test]
    fn test_missing_file_is_an_io_error() {
        let err = QuerySet::load("/nonexistent/queries.json").unwrap_err();
        assert_eq!(err.kind(), "io_error");
    }
}
