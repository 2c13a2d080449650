//! Error types for the replication engine.

use crate::store::StoreError;
use revsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplicationError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The remote answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// Malformed or unexpected wire data.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The local store rejected an operation.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The remote URL cannot be used.
    #[error("invalid remote URL: {0}")]
    InvalidUrl(String),

    /// No tokio runtime was available to drive replication.
    #[error("replicator must be created inside a tokio runtime")]
    NoRuntime,

    /// The replicator stopped before the operation completed.
    #[error("replicator stopped")]
    Stopped,
}

impl ReplicationError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates an HTTP status error.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    /// Returns the HTTP-style status code carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ReplicationError::Http { status, .. } => Some(*status),
            ReplicationError::Store(err) => Some(err.status_code()),
            _ => None,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplicationError::Transport { retryable, .. } => *retryable,
            ReplicationError::Http { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            _ => false,
        }
    }

    /// Returns true for a remote 404.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ReplicationError::Http { status: 404, .. })
    }
}

impl From<ProtocolError> for ReplicationError {
    fn from(err: ProtocolError) -> Self {
        ReplicationError::Protocol(err.to_string())
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(err: serde_json::Error) -> Self {
        ReplicationError::Protocol(err.to_string())
    }
}
