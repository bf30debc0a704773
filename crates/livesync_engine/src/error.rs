//! Error types for the sync engine.

use livesync_protocol::{ProtocolError, RemoteError, RemoteErrorCode};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The object or item does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The identity may not access the object.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The precondition revision did not match the authority's.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A caller-supplied argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unrecoverable failure; the client cannot continue.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// The unique name is already taken.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The mutator declined to produce new data.
    #[error("mutation aborted by caller")]
    Aborted,

    /// The authority replied with something unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The client was shut down.
    #[error("client is shut down")]
    Shutdown,
}

impl SyncError {
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

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Conflict(_) => true,
            _ => false,
        }
    }

    /// Returns true if this error ends a subscription for good.
    pub(crate) fn is_terminal_for_subscription(&self) -> bool {
        matches!(
            self,
            SyncError::NotFound(_) | SyncError::PermissionDenied(_) | SyncError::Fatal(_)
        )
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err.code {
            RemoteErrorCode::NotFound => SyncError::NotFound(err.message),
            RemoteErrorCode::PermissionDenied => SyncError::PermissionDenied(err.message),
            RemoteErrorCode::InvalidRequest => SyncError::InvalidArgument(err.message),
            RemoteErrorCode::Internal => SyncError::Fatal(err.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::Conflict("revision 3 != 4".into()).is_retryable());
        assert!(!SyncError::NotFound("ET1".into()).is_retryable());
        assert!(!SyncError::Aborted.is_retryable());
        assert!(!SyncError::Shutdown.is_retryable());
    }

    #[test]
    fn error_display() {
        let err = SyncError::Shutdown;
        assert_eq!(err.to_string(), "client is shut down");

        let err = SyncError::PermissionDenied("ET1".into());
        assert!(err.to_string().contains("ET1"));
    }

    #[test]
    fn remote_error_mapping() {
        let err: SyncError = RemoteError::new(RemoteErrorCode::NotFound, "ET9").into();
        assert_eq!(err, SyncError::NotFound("ET9".into()));
        assert!(err.is_terminal_for_subscription());

        let err: SyncError = RemoteError::new(RemoteErrorCode::PermissionDenied, "no").into();
        assert!(matches!(err, SyncError::PermissionDenied(_)));
    }

    #[test]
    fn protocol_error_conversion() {
        let err: SyncError = ProtocolError::UnexpectedReply {
            expected: "object",
            actual: "done",
        }
        .into();
        assert!(matches!(err, SyncError::Protocol(msg) if msg.contains("object")));
    }
}
