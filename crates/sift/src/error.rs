//! Error types for sift

use thiserror::Error;

/// Main error type for sift operations
#[derive(Error, Debug)]
pub enum SiftError {
    /// Configuration errors (missing keys, unparseable files)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backing-store errors (Redis, SQLite, in-memory store poisoning)
    #[error("Store error: {0}")]
    Store(String),

    /// LLM call or response-parsing errors
    #[error("LLM error: {0}")]
    Llm(String),

    /// Embedding generation errors
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Requested record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Identifier collision (e.g. duplicate alert id)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Rejected input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Relational database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for sift operations
pub type Result<T> = std::result::Result<T, SiftError>;
