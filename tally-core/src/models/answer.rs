use serde::{Deserialize, Serialize};

use super::context::RetrievedContext;

/// A synthesized answer plus the evidence it was grounded in and the
/// timing/token metadata the evaluation engine records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub context: RetrievedContext,
    pub latency_ms: u64,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Answer {
    pub fn token_count(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}
