//! Error types for the Tokenwarden service.

use thiserror::Error;

use crate::store::StoreError;

/// Service-level error type for startup, configuration and serving.
#[derive(Error, Debug)]
pub enum WardenError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared store errors surfaced outside of a rate limit check
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for WardenError {
    fn from(err: config::ConfigError) -> Self {
        WardenError::Config(err.to_string())
    }
}

/// Result type alias for Tokenwarden operations.
pub type Result<T> = std::result::Result<T, WardenError>;
