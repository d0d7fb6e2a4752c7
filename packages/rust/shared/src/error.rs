//! Error types for RaveDigest.
//!
//! Library crates use [`DigestError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all RaveDigest operations.
#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error (feed fetch, webhook, stage control call).
    #[error("network error: {0}")]
    Network(String),

    /// Message bus (database) error.
    #[error("bus error: {0}")]
    Bus(String),

    /// Append or claim against a topic that was never created.
    #[error("topic '{0}' not found")]
    TopicNotFound(String),

    /// Claim against a consumer group that was never created.
    #[error("consumer group '{group}' not found on topic '{topic}'")]
    GroupNotFound { topic: String, group: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad payload, bad schedule, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A stage transform failed on one message.
    #[error("transform error: {0}")]
    Transform(String),

    /// Delivering a digest to its destination failed.
    #[error("publish error: {0}")]
    Publish(String),

    /// A retried operation ran out of attempts.
    #[error("gave up after {attempts} attempts: {last_error}")]
    RetryExhausted {
        attempts: u32,
        last_error: Box<DigestError>,
    },

    /// A run was requested while another one is still active.
    #[error("a run is already in progress")]
    RunInProgress,
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, DigestError>;

impl DigestError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the failed operation could plausibly succeed.
    ///
    /// Config and validation problems are permanent; everything that talks to
    /// the outside world is treated as transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Bus(_) | Self::Transform(_) | Self::Publish(_) | Self::Io { .. }
        )
    }
}
