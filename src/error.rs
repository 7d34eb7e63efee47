//! Error types for the SMS rate limiter.

use std::time::Duration;
use thiserror::Error;

/// Main error type for rate limiter operations.
///
/// Only storage transactions fail at runtime; policies and clocks are
/// infallible once constructed.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors reported by the Redis client or server
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A stored client record could not be decoded
    #[error("Corrupt client state for key '{key}': {reason}")]
    CorruptState { key: String, reason: String },

    /// The optimistic transaction kept losing to concurrent writers
    #[error("Transaction on key '{key}' aborted after {attempts} conflicting attempts")]
    TransactionConflict { key: String, attempts: u32 },

    /// Connecting to the storage backend took too long
    #[error("Timed out after {0:?} connecting to storage")]
    Timeout(Duration),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for rate limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
