//! Error types for the Turnstile service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Limiter options rejected at construction time
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Configuration loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backing store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by a window store.
///
/// Every variant means the store could not be consulted. Callers decide
/// whether that admits or rejects the request.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached or refused the operation
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer within the configured deadline
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    /// Errors reported by the Redis client
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
