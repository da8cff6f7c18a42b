//! LLM client abstraction
//!
//! The judge only needs one primitive: turn a prompt into text. Everything
//! else (strict JSON contracts, fence stripping, batch alignment) lives in
//! the judge itself, so any OpenAI-compatible endpoint can back it.

mod openai;

pub use openai::OpenAiClient;

use async_trait::async_trait;

use crate::error::Result;

/// Text-generation port used by the judge
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate a completion for the prompt using the named model
    async fn generate(&self, model: &str, prompt: &str) -> Result<String>;
}
