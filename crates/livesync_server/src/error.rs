//! Error types for the authority.

use livesync_protocol::{ProtocolError, RemoteError, RemoteErrorCode};
use thiserror::Error;

/// Result type for authority operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors returned by the authority.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// No object or item matches the reference.
    #[error("not found: {0}")]
    NotFound(String),

    /// The unique name is already in use.
    #[error("unique name already exists: {0}")]
    NameAlreadyExists(String),

    /// The conditional write did not match the current revision.
    #[error("precondition failed: current revision is {actual}, request expected {expected}")]
    PreconditionFailed {
        /// Revision named by the request.
        expected: u64,
        /// Current revision.
        actual: u64,
    },

    /// The identity may not access the object.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Malformed or out-of-bounds request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The session token was rejected.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Internal authority error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns true if the request itself was at fault.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, ServerError::Internal(_))
    }

    /// Converts to the per-entry error carried by batch replies.
    pub fn to_remote(&self) -> RemoteError {
        let code = match self {
            ServerError::NotFound(_) => RemoteErrorCode::NotFound,
            ServerError::PermissionDenied(_) | ServerError::AuthenticationFailed(_) => {
                RemoteErrorCode::PermissionDenied
            }
            ServerError::NameAlreadyExists(_)
            | ServerError::PreconditionFailed { .. }
            | ServerError::InvalidRequest(_) => RemoteErrorCode::InvalidRequest,
            ServerError::Internal(_) => RemoteErrorCode::Internal,
        };
        RemoteError::new(code, self.to_string())
    }
}

impl From<ProtocolError> for ServerError {
    fn from(err: ProtocolError) -> Self {
        ServerError::InvalidRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::InvalidRequest("bad".into()).is_client_error());
        assert!(!ServerError::Internal("oops".into()).is_client_error());
    }

    #[test]
    fn error_display() {
        let err = ServerError::PreconditionFailed {
            expected: 5,
            actual: 10,
        };
        let msg = err.to_string();
        assert!(msg.contains("10"));
        assert!(msg.contains("5"));
    }

    #[test]
    fn remote_codes() {
        assert_eq!(
            ServerError::NotFound("ET1".into()).to_remote().code,
            RemoteErrorCode::NotFound
        );
        assert_eq!(
            ServerError::PermissionDenied("ET1".into()).to_remote().code,
            RemoteErrorCode::PermissionDenied
        );
    }
}
