//! Test utilities - deterministic mocks for the LLM and embedder ports
//!
//! Used by unit tests and the integration suite, and handy for wiring the
//! daemon up without network access.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::embedding::Embedder;
use crate::error::{Result, SiftError};
use crate::llm::LlmClient;

/// Scripted LLM: pops canned responses in order, then falls back to a
/// default response or errors out.
#[derive(Debug, Default)]
pub struct MockLlm {
    responses: Mutex<VecDeque<String>>,
    default_response: Option<String>,
    calls: Mutex<Vec<(String, String)>>,
}

impl MockLlm {
    /// Queue of one-shot responses, error once exhausted
    pub fn scripted(responses: &[&str]) -> Self {
        Self {
            responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
            default_response: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Same response for every call
    pub fn always(response: &str) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            default_response: Some(response.to_string()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Scripted queue with a fallback once exhausted
    pub fn scripted_then(responses: &[&str], fallback: &str) -> Self {
        Self {
            responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
            default_response: Some(fallback.to_string()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Append another canned response
    pub fn push(&self, response: &str) {
        self.responses.lock().unwrap().push_back(response.to_string());
    }

    /// Every (model, prompt) pair seen so far
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of generate calls made
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push((model.to_string(), prompt.to_string()));

        if let Some(response) = self.responses.lock().unwrap().pop_front() {
            return Ok(response);
        }
        match &self.default_response {
            Some(d) => Ok(d.clone()),
            None => Err(SiftError::Llm("mock responses exhausted".to_string())),
        }
    }
}

/// LLM that always fails, for error-path tests
#[derive(Debug, Default)]
pub struct FailingLlm;

#[async_trait]
impl LlmClient for FailingLlm {
    async fn generate(&self, _model: &str, _prompt: &str) -> Result<String> {
        Err(SiftError::Llm("mock failure".to_string()))
    }
}

/// Dimensionality of mock embeddings
pub const MOCK_EMBEDDING_DIM: usize = 16;

/// Deterministic embedder: hash-derived unit vectors, with optional pinned
/// vectors so tests can stage exact similarities.
#[derive(Debug, Default)]
pub struct MockEmbedder {
    pinned: Mutex<HashMap<String, Vec<f32>>>,
}

impl MockEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the vector returned for an exact text
    pub fn pin(&self, text: &str, vector: Vec<f32>) {
        self.pinned.lock().unwrap().insert(text.to_string(), vector);
    }

    /// Deterministic pseudo-random unit vector for a text
    pub fn vector_for(text: &str) -> Vec<f32> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let seed = hasher.finish();

        let mut v: Vec<f32> = (0..MOCK_EMBEDDING_DIM)
            .map(|i| {
                let x = seed
                    .wrapping_mul(i as u64 + 1)
                    .wrapping_add(0x9e3779b97f4a7c15);
                ((x as f32) / (u64::MAX as f32)) * 2.0 - 1.0
            })
            .collect();

        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(v) = self.pinned.lock().unwrap().get(text) {
            return Ok(v.clone());
        }
        Ok(Self::vector_for(text))
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for t in texts {
            out.push(self.embed_query(t).await?);
        }
        Ok(out)
    }
}

/// Embedder that always fails, for degraded-path tests
#[derive(Debug, Default)]
pub struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    async fn embed_query(&self, _text: &str) -> Result<Vec<f32>> {
        Err(SiftError::Embedding("mock failure".to_string()))
    }

    async fn embed_documents(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(SiftError::Embedding("mock failure".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_llm_scripted_order() {
        let llm = MockLlm::scripted(&["one", "two"]);
        assert_eq!(llm.generate("m", "p1").await.unwrap(), "one");
        assert_eq!(llm.generate("m", "p2").await.unwrap(), "two");
        assert!(llm.generate("m", "p3").await.is_err());
        assert_eq!(llm.call_count(), 3);
    }

    #[tokio::test]
    async fn test_mock_embedder_deterministic() {
        let e = MockEmbedder::new();
        let a = e.embed_query("same text").await.unwrap();
        let b = e.embed_query("same text").await.unwrap();
        let c = e.embed_query("other text").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), MOCK_EMBEDDING_DIM);

        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_mock_embedder_pinning() {
        let e = MockEmbedder::new();
        e.pin("special", vec![1.0, 0.0]);
        assert_eq!(e.embed_query("special").await.unwrap(), vec![1.0, 0.0]);
    }
}
