// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the CDC relay.
//!
//! Errors are categorized by their source (buffer storage, Kafka, MongoDB,
//! etc.) and include context to help with debugging.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Kafka` | Yes | Producer write failures, broker unavailable |
//! | `ChangeStream` | Yes | Cursor loss, upstream connection drops |
//! | `Storage` | No | Local SQLite errors (needs operator attention) |
//! | `NotFound` | No | Buffer key absent where one was required |
//! | `Serialization` | No | Malformed event payload |
//! | `Config` | No | Configuration invalid |
//! | `Shutdown` | No | Relay is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`RelayError::is_retryable()`] to determine if an operation should be
//! retried with backoff. Retryable errors indicate transient network or
//! availability issues; non-retryable errors indicate bugs, configuration
//! problems, or data corruption.

use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that can occur while relaying events.
#[derive(Error, Debug)]
pub enum RelayError {
    /// SQLite error in the durable buffer.
    ///
    /// Not retryable - indicates local database issues that need attention.
    #[error("Buffer storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// A buffer key was required but absent.
    ///
    /// Returned by `update_retries` when the event was deleted concurrently.
    #[error("Event not found: {key}")]
    NotFound { key: String },

    /// Event encode/decode failure.
    ///
    /// Not retryable - the payload is malformed. Callers skip the event.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Kafka producer error.
    ///
    /// Retryable with exponential backoff.
    #[error("Kafka error ({operation}): {message}")]
    Kafka { operation: String, message: String },

    /// Change stream failure (cursor loss, connection drop).
    ///
    /// Fatal for the watcher component; a process restart resumes from the
    /// persisted resume token.
    #[error("Change stream error ({operation}): {message}")]
    ChangeStream { operation: String, message: String },

    /// Invalid or missing configuration.
    ///
    /// Fatal at startup only.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shutdown in progress.
    ///
    /// Returned when a blocking operation is interrupted by the shutdown
    /// signal. Not retryable - the relay is terminating.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Create a Kafka error with operation context.
    pub fn kafka(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Kafka {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a change stream error with operation context.
    pub fn change_stream(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ChangeStream {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kafka { .. } => true,
            Self::ChangeStream { .. } => true,
            Self::Storage(_) => false,
            Self::NotFound { .. } => false,
            Self::Serialization(_) => false,
            Self::Config(_) => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}
