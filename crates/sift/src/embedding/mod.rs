//! Text embedding port and the remote implementation

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::EmbeddingConfig;
use crate::error::{Result, SiftError};

/// Embedding port used by staging dedup, promotion and retrieval
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single query or summary
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of documents
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// OpenAI-compatible `/embeddings` client
#[derive(Debug)]
pub struct OpenAiEmbedder {
    client: Client,
    api_url: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = env::var(&config.api_key_env).map_err(|_| {
            SiftError::Config(format!("API key env var '{}' not set", config.api_key_env))
        })?;
        Self::with_endpoint(&config.api_url, &api_key, &config.model, config.timeout_secs)
    }

    pub fn with_endpoint(
        api_url: &str,
        api_key: &str,
        model: &str,
        timeout_secs: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| SiftError::Embedding(e.to_string()))?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    async fn call(&self, input: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.api_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&EmbeddingRequest {
                model: &self.model,
                input,
            })
            .send()
            .await
            .map_err(|e| SiftError::Embedding(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(SiftError::Embedding(format!(
                "API returned {status}: {body}"
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| SiftError::Embedding(format!("malformed response: {e}")))?;

        if parsed.data.len() != input.len() {
            return Err(SiftError::Embedding(format!(
                "expected {} vectors, got {}",
                input.len(),
                parsed.data.len()
            )));
        }

        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let out = self.call(&[text.to_string()]).await?;
        out.into_iter()
            .next()
            .ok_or_else(|| SiftError::Embedding("empty response".to_string()))
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.call(texts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_embed_query() {
        let server = MockServer::start().await;
        let body = serde_json::json!({
            "data": [{"embedding": [0.1, 0.2, 0.3]}]
        });
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let embedder =
            OpenAiEmbedder::with_endpoint(&server.uri(), "k", "text-embedding-3-small", 5).unwrap();
        let vec = embedder.embed_query("hello").await.unwrap();
        assert_eq!(vec, vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn test_embed_documents_length_mismatch_is_error() {
        let server = MockServer::start().await;
        let body = serde_json::json!({
            "data": [{"embedding": [0.1]}]
        });
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let embedder = OpenAiEmbedder::with_endpoint(&server.uri(), "k", "m", 5).unwrap();
        let err = embedder
            .embed_documents(&["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expected 2"));
    }
}
