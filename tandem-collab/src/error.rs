use tandem_core::{DocumentId, EngineError};
use uuid::Uuid;

use crate::auth::AuthError;
use crate::protocol::{ErrorCode, ProtocolError};
use crate::storage::StoreError;

/// Errors surfaced by the session manager and the connection handler.
///
/// Every variant is scoped to one session or one document; none of them
/// affects other documents.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollabError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("authentication did not complete in time")]
    AuthTimeout,
    #[error("user {user_id} may not open {document_id}")]
    Forbidden {
        user_id: String,
        document_id: DocumentId,
    },
    #[error("malformed operation: {0}")]
    MalformedOperation(String),
    #[error("session {0} is read-only")]
    ReadOnly(Uuid),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("session {0} is not attached")]
    SessionNotFound(Uuid),
    #[error("document {0} is not active")]
    DocumentNotActive(DocumentId),
    #[error("document {document_id} already has {limit} sessions")]
    RoomFull {
        document_id: DocumentId,
        limit: usize,
    },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl CollabError {
    /// Wire code for the `error` frame reporting this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            CollabError::Unauthorized(_) => ErrorCode::Unauthorized,
            CollabError::AuthTimeout => ErrorCode::AuthTimeout,
            CollabError::Forbidden { .. } => ErrorCode::Forbidden,
            CollabError::MalformedOperation(_) => ErrorCode::MalformedOperation,
            CollabError::ReadOnly(_) => ErrorCode::ReadOnly,
            CollabError::StoreUnavailable(_) => ErrorCode::StoreUnavailable,
            CollabError::SessionNotFound(_) | CollabError::DocumentNotActive(_) => {
                ErrorCode::Internal
            }
            CollabError::RoomFull { .. } => ErrorCode::RoomFull,
            CollabError::Protocol(_) => ErrorCode::ProtocolViolation,
        }
    }
}

impl From<EngineError> for CollabError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::MalformedOperation(msg) => CollabError::MalformedOperation(msg),
            EngineError::Busy(msg) => CollabError::MalformedOperation(msg),
        }
    }
}

impl From<StoreError> for CollabError {
    fn from(e: StoreError) -> Self {
        CollabError::StoreUnavailable(e.to_string())
    }
}

impl From<AuthError> for CollabError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Unauthorized(msg) => CollabError::Unauthorized(msg),
            // Fail closed.
            AuthError::Unavailable(msg) => CollabError::Unauthorized(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions() {
        let e: CollabError = EngineError::MalformedOperation("bad".into()).into();
        assert_eq!(e, CollabError::MalformedOperation("bad".into()));
        assert_eq!(e.code(), ErrorCode::MalformedOperation);

        let e: CollabError = StoreError::Unavailable("down".into()).into();
        assert!(matches!(e, CollabError::StoreUnavailable(_)));

        let e: CollabError = AuthError::Unavailable("idp down".into()).into();
        assert!(matches!(e, CollabError::Unauthorized(_)));

        let e: CollabError = ProtocolError::EmptyFrame.into();
        assert_eq!(e.code(), ErrorCode::ProtocolViolation);
    }
}
