//! Generative-model capability for Tally — planning, synthesis and judging
//!
//! Provides a `GenerativeBackend` trait with implementations for:
//! - **Chat** — any OpenAI-compatible chat-completions API (Groq, OpenAI)
//! - **Scripted** — deterministic canned responses for tests and offline runs
//!
//! Every call is bounded by the client timeout and retried with exponential
//! backoff; the usage report from the API feeds token accounting downstream.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::config::ModelConfig;

// ============================================================================
// GenerativeBackend trait
// ============================================================================

/// One completed generation: the text plus the provider's usage report.
#[derive(Debug, Clone, Default)]
pub struct Generation {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Generation {
    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Abstraction over text-generation providers. The pipeline and the
/// evaluation engine only ever see this trait, so all of their logic is
/// testable against `ScriptedBackend`.
#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    /// Generate a completion for the given system contract and user prompt.
    async fn generate(&self, system: &str, user: &str) -> Result<Generation, LlmError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

// ============================================================================
// Error types
// ============================================================================

/// Generation errors
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Empty completion in response")]
    EmptyCompletion,

    #[error("Missing API key (expected in {env_var})")]
    MissingApiKey { env_var: String },

    #[error("All {attempts} retry attempts failed")]
    RetryExhausted { attempts: usize },

    #[error("Script exhausted after {served} responses")]
    ScriptExhausted { served: usize },
}

// ============================================================================
// Chat-completions API structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatErrorResponse {
    error: Option<ChatErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ChatErrorDetail {
    message: String,
}

// ============================================================================
// ChatClient
// ============================================================================

/// Chat-completions client — speaks the OpenAI wire format, which both the
/// planner/synthesizer provider (Groq) and the judge provider (OpenAI) use.
#[derive(Debug, Clone)]
pub struct ChatClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    max_retries: usize,
    retry_delay_ms: u64,
}

impl ChatClient {
    pub fn new(config: &ModelConfig) -> Result<Self, LlmError> {
        let api_key = std::env::var(&config.api_key_env).unwrap_or_default();
        Self::with_base_url(config, api_key, config.base_url.clone())
    }

    /// Create a client with an explicit key and base URL (for testing / integration)
    pub fn with_base_url(
        config: &ModelConfig,
        api_key: String,
        base_url: String,
    ) -> Result<Self, LlmError> {
        if api_key.is_empty() {
            return Err(LlmError::MissingApiKey {
                env_var: config.api_key_env.clone(),
            });
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            base_url,
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
        })
    }

    async fn complete_once(&self, system: &str, user: &str) -> Result<Generation, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            // Scores and generated statements must be reproducible across calls
            temperature: 0.0,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ChatErrorResponse>(&error_body)
                .ok()
                .and_then(|e| e.error)
                .map(|e| e.message)
                .unwrap_or(error_body);

            tracing::error!(code = status.as_u16(), message = %message, "Chat API error");

            return Err(LlmError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let chat_response: ChatResponse = response.json().await?;
        let usage = chat_response.usage.unwrap_or_default();

        let text = chat_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or(LlmError::EmptyCompletion)?;

        Ok(Generation {
            text,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        })
    }
}

#[async_trait]
impl GenerativeBackend for ChatClient {
    async fn generate(&self, system: &str, user: &str) -> Result<Generation, LlmError> {
        let retry_strategy = ExponentialBackoff::from_millis(self.retry_delay_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.max_retries);

        let result = Retry::spawn(retry_strategy, || self.complete_once(system, user)).await;

        match result {
            Ok(generation) => Ok(generation),
            Err(e) => {
                tracing::error!(
                    attempts = self.max_retries,
                    error = %e,
                    "All chat completion retry attempts failed"
                );
                Err(LlmError::RetryExhausted {
                    attempts: self.max_retries,
                })
            }
        }
    }

    fn name(&self) -> &str {
        "chat"
    }
}

// ============================================================================
// ScriptedBackend
// ============================================================================

/// Deterministic backend that serves a fixed script of responses in order.
/// Used by unit and scenario tests, and by offline development where no
/// model API is reachable.
pub struct ScriptedBackend {
    script: Mutex<VecDeque<String>>,
    served: Mutex<usize>,
}

impl ScriptedBackend {
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            script: Mutex::new(responses.into_iter().map(String::from).collect()),
            served: Mutex::new(0),
        }
    }

    pub fn push(&self, response: &str) {
        self.script.lock().unwrap().push_back(response.to_string());
    }

    /// Number of responses handed out so far.
    pub fn served(&self) -> usize {
        *self.served.lock().unwrap()
    }
}

#[async_trait]
impl GenerativeBackend for ScriptedBackend {
    async fn generate(&self, _system: &str, _user: &str) -> Result<Generation, LlmError> {
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(text) => {
                let mut served = self.served.lock().unwrap();
                *served += 1;
                Ok(Generation {
                    text,
                    prompt_tokens: 0,
                    completion_tokens: 0,
                })
            }
            None => Err(LlmError::ScriptExhausted {
                served: self.served(),
            }),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> ModelConfig {
        ModelConfig {
            base_url: "http://unused".to_string(),
            model: "llama-3.3-70b-versatile".to_string(),
            api_key_env: "TEST_LLM_KEY".to_string(),
            max_retries: 3,
            retry_delay_ms: 50,
            timeout_seconds: 5,
        }
    }

    fn mock_chat_response(content: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [
                { "message": { "role": "assistant", "content": content } }
            ],
            "usage": { "prompt_tokens": 42, "completion_tokens": 7, "total_tokens": 49 }
        })
    }

    #[tokio::test]
    async fn test_generate_returns_text_and_usage() {
        let mock_server = MockServer::start().await;
        let client = ChatClient::with_base_url(
            &test_config(),
            "test-api-key".to_string(),
            mock_server.uri(),
        )
        .expect("Failed to create client");

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-api-key"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(mock_chat_response("SELECT 1")),
            )
            .mount(&mock_server)
            .await;

        let result = client.generate("system", "user").await;

        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result.err());
        let generation = result.unwrap();
        assert_eq!(generation.text, "SELECT 1");
        assert_eq!(generation.prompt_tokens, 42);
        assert_eq!(generation.completion_tokens, 7);
        assert_eq!(generation.total_tokens(), 49);
    }

    #[tokio::test]
    async fn test_generate_retries_on_429_then_succeeds() {
        let mock_server = MockServer::start().await;
        let client = ChatClient::with_base_url(
            &test_config(),
            "test-api-key".to_string(),
            mock_server.uri(),
        )
        .unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "error": { "message": "Rate limit exceeded" }
            })))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(mock_chat_response("ok")))
            .mount(&mock_server)
            .await;

        let result = client.generate("system", "user").await;
        assert!(result.is_ok(), "Expected success after retry");
        assert_eq!(result.unwrap().text, "ok");
    }

    #[tokio::test]
    async fn test_generate_returns_retry_exhausted_on_persistent_500() {
        let mock_server = MockServer::start().await;
        let client = ChatClient::with_base_url(
            &test_config(),
            "test-api-key".to_string(),
            mock_server.uri(),
        )
        .unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "error": { "message": "Internal server error" }
            })))
            .mount(&mock_server)
            .await;

        let result = client.generate("system", "user").await;
        match result {
            Err(LlmError::RetryExhausted { attempts }) => assert_eq!(attempts, 3),
            other => panic!("Expected RetryExhausted, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_client_fails_without_api_key() {
        let result =
            ChatClient::with_base_url(&test_config(), String::new(), "http://x".to_string());
        match result {
            Err(LlmError::MissingApiKey { env_var }) => assert_eq!(env_var, "TEST_LLM_KEY"),
            _ => panic!("Expected MissingApiKey error"),
        }
    }

    #[tokio::test]
    async fn test_missing_choices_is_empty_completion() {
        let mock_server = MockServer::start().await;
        let config = ModelConfig {
            max_retries: 1,
            ..test_config()
        };
        let client =
            ChatClient::with_base_url(&config, "k".to_string(), mock_server.uri()).unwrap();

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})),
            )
            .mount(&mock_server)
            .await;

        let result = client.complete_once("s", "u").await;
        assert!(matches!(result, Err(LlmError::EmptyCompletion)));
    }

    // --- ScriptedBackend ---

    #[tokio::test]
    async fn test_scripted_backend_serves_in_order_then_exhausts() {
        let backend = ScriptedBackend::new(vec!["first", "second"]);

        assert_eq!(backend.generate("s", "u").await.unwrap().text, "first");
        assert_eq!(backend.generate("s", "u").await.unwrap().text, "second");
        assert_eq!(backend.served(), 2);

        match backend.generate("s", "u").await {
            Err(LlmError::ScriptExhausted { served }) => assert_eq!(served, 2),
            other => panic!("Expected ScriptExhausted, got {:?}", other.err()),
        }
    }
}
