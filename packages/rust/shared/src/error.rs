//! Error types for the news feed pipeline.
//!
//! Library crates use [`NewsfeedError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;
use std::time::Duration;

use crate::types::StageName;

/// Top-level error type for all pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum NewsfeedError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// The request budget for the current window is spent and the caller
    /// asked not to wait.
    #[error("rate limit exceeded, budget frees up in {}ms", retry_after.as_millis())]
    RateLimitExceeded { retry_after: Duration },

    /// Search provider failure (HTTP, decoding, provider-side error).
    #[error("provider error: {message}")]
    Provider { message: String, retryable: bool },

    /// Transformation service failure (LLM backend, malformed envelope).
    #[error("service error: {message}")]
    Service { message: String, retryable: bool },

    /// A single external call exceeded its time bound.
    #[error("call timed out after {}ms", after.as_millis())]
    Timeout { after: Duration },

    /// Data does not match the expected schema.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A stage's required input artifact is absent or unparsable.
    #[error("artifact for stage {stage} missing at {path:?}: {reason}")]
    ArtifactMissing {
        stage: StageName,
        path: PathBuf,
        reason: String,
    },

    /// The report could not be handed to the delivery provider.
    #[error("delivery error: {message}")]
    Delivery { message: String, retryable: bool },

    /// Run ledger (libSQL) error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, NewsfeedError>;

impl NewsfeedError {
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

    /// Provider error worth retrying (timeouts, 429, 5xx).
    pub fn provider_transient(msg: impl Into<String>) -> Self {
        Self::Provider {
            message: msg.into(),
            retryable: true,
        }
    }

    /// Provider error that will not improve on retry (bad request, auth).
    pub fn provider_fatal(msg: impl Into<String>) -> Self {
        Self::Provider {
            message: msg.into(),
            retryable: false,
        }
    }

    /// Transform service error worth retrying.
    pub fn service_transient(msg: impl Into<String>) -> Self {
        Self::Service {
            message: msg.into(),
            retryable: true,
        }
    }

    /// Transform service error that will not improve on retry.
    pub fn service_fatal(msg: impl Into<String>) -> Self {
        Self::Service {
            message: msg.into(),
            retryable: false,
        }
    }

    /// Delivery error; `retryable` follows the provider's status class.
    pub fn delivery(msg: impl Into<String>, retryable: bool) -> Self {
        Self::Delivery {
            message: msg.into(),
            retryable,
        }
    }

    /// Predecessor artifact absent or unparsable.
    pub fn artifact_missing(
        stage: StageName,
        path: impl Into<PathBuf>,
        reason: impl Into<String>,
    ) -> Self {
        Self::ArtifactMissing {
            stage,
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the retry loop should try this call again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Provider { retryable, .. }
            | Self::Service { retryable, .. }
            | Self::Delivery { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Short machine-friendly label, used in diagnostics and ledger rows.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::Provider { .. } => "provider_error",
            Self::Service { .. } => "service_error",
            Self::Timeout { .. } => "timeout",
            Self::Validation { .. } => "validation_error",
            Self::ArtifactMissing { .. } => "artifact_missing",
            Self::Delivery { .. } => "delivery_error",
            Self::Storage(_) => "storage_error",
            Self::Io { .. } => "io_error",
        }
    }

    /// Terminal form after the retry cap. The error takes the class of the
    /// boundary that gave up, and the attempt count is folded into the
    /// message.
    pub fn exhausted(self, attempts: u32, boundary: Boundary) -> Self {
        let detail = match self {
            Self::Provider { message, .. }
            | Self::Service { message, .. }
            | Self::Delivery { message, .. } => message,
            other => other.to_string(),
        };
        let message = format!("gave up after {attempts} attempts: {detail}");
        match boundary {
            Boundary::Search => Self::Provider {
                message,
                retryable: false,
            },
            Boundary::Transform => Self::Service {
                message,
                retryable: false,
            },
            Boundary::Delivery => Self::Delivery {
                message,
                retryable: false,
            },
        }
    }
}

/// External system a rate-limited call talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Boundary {
    #[default]
    Search,
    Transform,
    Delivery,
}
