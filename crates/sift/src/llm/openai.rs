//! OpenAI-compatible chat-completion client
//!
//! Works against any endpoint speaking the `/chat/completions` protocol.
//! Rate-limit responses (429) are retried with exponential backoff; other
//! failures surface immediately so the caller can skip the batch.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::error::{Result, SiftError};
use crate::llm::LlmClient;

const MAX_RETRIES: u32 = 3;

/// Chat-completion client for OpenAI-compatible APIs
#[derive(Debug)]
pub struct OpenAiClient {
    client: Client,
    api_url: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

impl OpenAiClient {
    /// Create a client from configuration.
    ///
    /// The API key is read from the environment variable named in
    /// `config.api_key_env`; a missing variable is a configuration error.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = env::var(&config.api_key_env).map_err(|_| {
            SiftError::Config(format!("API key env var '{}' not set", config.api_key_env))
        })?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SiftError::Llm(e.to_string()))?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Construct directly from parts (used by tests against a mock server)
    pub fn with_endpoint(api_url: &str, api_key: &str, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| SiftError::Llm(e.to_string()))?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String> {
        let request = ChatCompletionRequest {
            model,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
            temperature: 0.2,
        };

        let url = format!("{}/chat/completions", self.api_url);
        debug!(model, "calling chat completion endpoint");

        let mut last_error = None;
        let mut delay = Duration::from_secs(1);

        for attempt in 0..MAX_RETRIES {
            match self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&request)
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status();

                    if status.as_u16() == 429 {
                        warn!(
                            attempt = attempt + 1,
                            max = MAX_RETRIES,
                            ?delay,
                            "rate limited, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                        continue;
                    }

                    if !status.is_success() {
                        let body = response
                            .text()
                            .await
                            .unwrap_or_else(|_| "unknown error".to_string());
                        return Err(SiftError::Llm(format!("API returned {status}: {body}")));
                    }

                    let completion: ChatCompletionResponse = response
                        .json()
                        .await
                        .map_err(|e| SiftError::Llm(format!("malformed response: {e}")))?;

                    return completion
                        .choices
                        .into_iter()
                        .next()
                        .map(|c| c.message.content)
                        .ok_or_else(|| SiftError::Llm("empty response".to_string()));
                }
                Err(e) => {
                    last_error = Some(e.to_string());
                    if attempt < MAX_RETRIES - 1 {
                        warn!(attempt = attempt + 1, error = %e, "request failed, retrying");
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        Err(SiftError::Llm(format!(
            "failed after {MAX_RETRIES} retries: {}",
            last_error.unwrap_or_else(|| "unknown error".to_string())
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn completion_body(content: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{"message": {"content": content}}]
        })
    }

    #[tokio::test]
    async fn test_generate_returns_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("hello")))
            .mount(&server)
            .await;

        let client = OpenAiClient::with_endpoint(&server.uri(), "test-key", 5).unwrap();
        let out = client.generate("gpt-4o-mini", "say hello").await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn test_generate_retries_on_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("ok")))
            .mount(&server)
            .await;

        let client = OpenAiClient::with_endpoint(&server.uri(), "k", 5).unwrap();
        let start = std::time::Instant::now();
        let out = client.generate("m", "p").await.unwrap();
        assert_eq!(out, "ok");
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_generate_surfaces_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = OpenAiClient::with_endpoint(&server.uri(), "k", 5).unwrap();
        let err = client.generate("m", "p").await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }
}
