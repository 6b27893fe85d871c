use serde::{Deserialize, Serialize};

/// One incoming question. Lives for the duration of a single request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub text: String,
    #[serde(default)]
    pub reference_answer: Option<String>,
    #[serde(default)]
    pub evaluate: bool,
}

impl Question {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            reference_answer: None,
            evaluate: false,
        }
    }
}
