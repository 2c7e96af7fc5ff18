//! Error types for the kvtree prefix cache

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for kvtree operations
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvTreeError {
    /// The page allocator could not satisfy a request, even after eviction
    #[error("Out of memory: {message}")]
    OutOfMemory { message: String },

    /// An unlock was issued against a node whose lock count is already zero
    #[error("Lock imbalance: {message}")]
    LockImbalance { message: String },

    /// The tree structure disagrees with its own invariants
    #[error("Invariant violation: {message}")]
    InvariantViolation { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Invalid parameters passed to an operation
    #[error("Invalid parameter: {message}")]
    InvalidParameter { message: String },

    /// Not found errors
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// Scheduling/queue errors
    #[error("Scheduler error: {message}")]
    Scheduler { message: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// I/O errors
    #[error("I/O error: {message}")]
    IO { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl KvTreeError {
    /// Create an out of memory error
    pub fn out_of_memory(message: impl Into<String>) -> Self {
        Self::OutOfMemory {
            message: message.into(),
        }
    }

    /// Create a lock imbalance error
    pub fn lock_imbalance(message: impl Into<String>) -> Self {
        Self::LockImbalance {
            message: message.into(),
        }
    }

    /// Create an invariant violation error
    pub fn invariant_violation(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a scheduler error
    pub fn scheduler(message: impl Into<String>) -> Self {
        Self::Scheduler {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(message: impl Into<String>) -> Self {
        Self::IO {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Allocator pressure is the only condition worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }

    /// Errors that signal a broken accounting or structure invariant
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::LockImbalance { .. } | Self::InvariantViolation { .. } | Self::Internal { .. }
        )
    }
}

/// Conversion from std::io::Error
impl From<std::io::Error> for KvTreeError {
    fn from(err: std::io::Error) -> Self {
        Self::io(format!("{}", err))
    }
}

/// Conversion from serde_json::Error
impl From<serde_json::Error> for KvTreeError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(format!("{}", err))
    }
}

/// Conversion from toml::de::Error
impl From<toml::de::Error> for KvTreeError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(format!("Failed to parse config: {}", err))
    }
}
