//! Error types for Shardex.

use thiserror::Error;

/// Result type alias using ShardexError.
pub type Result<T> = std::result::Result<T, ShardexError>;

/// Errors that can occur in Shardex operations.
#[derive(Debug, Error)]
pub enum ShardexError {
    // Index errors
    #[error("Key not found")]
    KeyNotFound,

    #[error("Duplicate key")]
    DuplicateKey,

    #[error("Key too large: {size} bytes (max {max})")]
    KeyTooLarge { size: usize, max: usize },

    #[error("Index structure corrupted: {reason}")]
    CorruptStructure { reason: String },

    // Concurrency errors
    #[error("Lock wait timed out after {waited_ms} ms")]
    LockTimeout { waited_ms: u64 },

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },
}

impl ShardexError {
    /// Returns true if the operation may succeed when retried.
    ///
    /// Only lock-wait exhaustion is transient; every other error reflects
    /// state that a retry would hit again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ShardexError::LockTimeout { .. })
    }

    /// Shorthand for a corruption error with a formatted reason.
    pub fn corrupt(reason: impl Into<String>) -> Self {
        ShardexError::CorruptStructure {
            reason: reason.into(),
        }
    }
}
