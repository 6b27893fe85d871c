//! Web-search capability — external search tool behind a single POST
//!
//! Talks to a Tavily-style search API. The pipeline treats this as a
//! best-effort collaborator: any failure here surfaces as a `ToolError`
//! and the caller degrades to database-only context.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::SearchConfig;

/// One ranked search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub title: Option<String>,
    pub snippet: Option<String>,
}

/// Search tool errors
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Search API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Missing API key (expected in {env_var})")]
    MissingApiKey { env_var: String },
}

#[derive(Debug, Serialize)]
struct SearchRequest {
    api_key: String,
    query: String,
    max_results: u32,
    search_depth: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResultItem>,
}

#[derive(Debug, Deserialize)]
struct SearchResultItem {
    url: String,
    title: Option<String>,
    content: Option<String>,
}

/// Tavily-style search client.
#[derive(Debug, Clone)]
pub struct SearchClient {
    client: Client,
    api_key: String,
    base_url: String,
    max_results: u32,
}

impl SearchClient {
    pub fn new(config: &SearchConfig) -> Result<Self, SearchError> {
        let api_key = std::env::var(&config.api_key_env).unwrap_or_default();
        Self::with_base_url(config, api_key, config.base_url.clone())
    }

    /// Create a client with an explicit key and base URL (for testing / integration)
    pub fn with_base_url(
        config: &SearchConfig,
        api_key: String,
        base_url: String,
    ) -> Result<Self, SearchError> {
        if api_key.is_empty() {
            return Err(SearchError::MissingApiKey {
                env_var: config.api_key_env.clone(),
            });
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url,
            max_results: config.max_results.clamp(1, 10),
        })
    }

    /// Run one search request and return ranked hits.
    pub async fn search(&self, query: &str) -> Result<Vec<SearchHit>, SearchError> {
        let url = format!("{}/search", self.base_url);

        let request = SearchRequest {
            api_key: self.api_key.clone(),
            query: query.to_string(),
            max_results: self.max_results,
            search_depth: "basic".to_string(),
        };

        let response = self.client.post(&url).json(&request).send().await?;
        let status = response.status();

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            tracing::error!(code = status.as_u16(), message = %message, "Search API error");
            return Err(SearchError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let body: SearchResponse = response.json().await?;

        Ok(body
            .results
            .into_iter()
            .take(self.max_results as usize)
            .map(|item| SearchHit {
                url: item.url,
                title: item.title,
                snippet: item.content,
            })
            .collect())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> SearchConfig {
        SearchConfig {
            enabled: true,
            base_url: "http://unused".to_string(),
            api_key_env: "TEST_SEARCH_KEY".to_string(),
            max_results: 3,
            timeout_seconds: 5,
        }
    }

    #[tokio::test]
    async fn test_search_returns_ranked_hits() {
        let mock_server = MockServer::start().await;
        let client =
            SearchClient::with_base_url(&test_config(), "key".to_string(), mock_server.uri())
                .unwrap();

        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [
                    { "url": "https://a.example", "title": "A", "content": "first" },
                    { "url": "https://b.example", "title": "B", "content": "second" }
                ]
            })))
            .mount(&mock_server)
            .await;

        let hits = client.search("weather today").await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].url, "https://a.example");
        assert_eq!(hits[0].snippet.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_search_truncates_to_max_results() {
        let mock_server = MockServer::start().await;
        let client =
            SearchClient::with_base_url(&test_config(), "key".to_string(), mock_server.uri())
                .unwrap();

        let results: Vec<_> = (0..8)
            .map(|i| serde_json::json!({ "url": format!("https://{i}.example") }))
            .collect();

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "results": results })),
            )
            .mount(&mock_server)
            .await;

        let hits = client.search("anything").await.unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[tokio::test]
    async fn test_search_surfaces_api_error() {
        let mock_server = MockServer::start().await;
        let client =
            SearchClient::with_base_url(&test_config(), "key".to_string(), mock_server.uri())
                .unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("upstream down"))
            .mount(&mock_server)
            .await;

        match client.search("anything").await {
            Err(SearchError::Api { code, message }) => {
                assert_eq!(code, 502);
                assert!(message.contains("upstream down"));
            }
            other => panic!("Expected Api error, got {:?}", other),
        }
    }

    #[test]
    fn test_client_fails_without_api_key() {
        let result =
            SearchClient::with_base_url(&test_config(), String::new(), "http://x".to_string());
        assert!(matches!(result, Err(SearchError::MissingApiKey { .. })));
    }
}
