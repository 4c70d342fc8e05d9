//! Error types for Pairgate

use thiserror::Error;

/// Main error type for Pairgate operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using Pairgate's Error
pub type Result<T> = std::result::Result<T, Error>;
