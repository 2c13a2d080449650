//! Error types for protocol parsing.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while decoding replication wire data.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The payload was not valid JSON.
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A required field was absent.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// A field was present but had an unusable value.
    #[error("invalid value for `{field}`: {message}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// What was wrong with it.
        message: String,
    },
}

impl ProtocolError {
    /// Creates an invalid field error.
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            message: message.into(),
        }
    }
}
