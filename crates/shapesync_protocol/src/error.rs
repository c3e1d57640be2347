//! Error types for protocol decoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while interpreting change-feed messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A header that must hold an LSN held something else.
    #[error("invalid lsn in header `{field}`: {value}")]
    InvalidLsn {
        /// Header name.
        field: &'static str,
        /// Offending raw value.
        value: String,
    },

    /// A required header was absent.
    #[error("missing header `{0}`")]
    MissingHeader(&'static str),

    /// The message does not have the shape of a change or control message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// JSON decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Creates an invalid-LSN error for a header.
    pub fn invalid_lsn(field: &'static str, value: impl ToString) -> Self {
        Self::InvalidLsn {
            field,
            value: value.to_string(),
        }
    }
}
