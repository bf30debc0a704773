//! Protocol-level errors.

use thiserror::Error;

/// Errors raised while interpreting protocol values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A page token could not be decoded.
    #[error("invalid page token: {0}")]
    InvalidPageToken(String),

    /// A SID prefix did not match any known object kind.
    #[error("unknown sid prefix: {0}")]
    UnknownSidPrefix(String),

    /// A reply did not match the command that produced it.
    #[error("unexpected reply: expected {expected}, got {actual}")]
    UnexpectedReply {
        /// The reply kind the caller expected.
        expected: &'static str,
        /// The reply kind actually received.
        actual: &'static str,
    },
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
