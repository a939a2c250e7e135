//! Service error taxonomy.
//!
//! One typed error covers everything a caller can observe over the bus.
//! Infrastructure errors during startup stay on `anyhow` and are fatal.

use askd_protocol::{ErrorCode, ErrorResponse};
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced to bus callers.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("no input provided. Provide input via positional query, stdin, or attachment")]
    EmptyQuery,

    #[error("the query is too short ({len} chars, minimum {min})")]
    InvalidQuery { len: usize, min: usize },

    #[error("attachment {0} does not exist")]
    AttachmentNotFound(PathBuf),

    #[error("attachment {path} could not be read: {source}")]
    AttachmentUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("attachment {0} appears to be binary")]
    BinaryAttachment(PathBuf),

    #[error("could not resolve caller identity: {0}")]
    IdentityResolution(String),

    #[error("access denied for uid {uid}")]
    PermissionDenied { uid: u32 },

    #[error("history store operation failed: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("missing credential '{0}'")]
    CredentialMissing(String),

    #[error("history is disabled in the daemon configuration")]
    HistoryNotEnabled,

    #[error("no session with id {0}")]
    SessionNotFound(String),

    #[error("the backend did not answer within {0} seconds")]
    BackendTimeout(u64),

    #[error("the backend could not be reached: {0}")]
    BackendUnavailable(String),

    #[error("the backend answered but the response could not be written to history")]
    ResponseNotStored {
        /// The answer that was generated; delivered despite the failed write.
        response: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(#[source] anyhow::Error),
}

impl ServiceError {
    /// Wire error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            ServiceError::EmptyQuery => ErrorCode::EmptyQuery,
            ServiceError::InvalidQuery { .. } => ErrorCode::InvalidQuery,
            ServiceError::AttachmentNotFound(_) => ErrorCode::AttachmentNotFound,
            ServiceError::AttachmentUnreadable { .. } => ErrorCode::AttachmentUnreadable,
            ServiceError::BinaryAttachment(_) => ErrorCode::BinaryAttachment,
            ServiceError::IdentityResolution(_) => ErrorCode::IdentityResolution,
            ServiceError::PermissionDenied { .. } => ErrorCode::PermissionDenied,
            ServiceError::Storage(_) => ErrorCode::Storage,
            ServiceError::CredentialMissing(_) => ErrorCode::CredentialMissing,
            ServiceError::HistoryNotEnabled => ErrorCode::HistoryNotEnabled,
            ServiceError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            ServiceError::BackendTimeout(_) => ErrorCode::BackendTimeout,
            ServiceError::BackendUnavailable(_) => ErrorCode::BackendUnavailable,
            ServiceError::ResponseNotStored { .. } => ErrorCode::ResponseNotStored,
            ServiceError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            ServiceError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Wire representation.
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping() {
        assert_eq!(ServiceError::EmptyQuery.code(), ErrorCode::EmptyQuery);
        assert_eq!(
            ServiceError::PermissionDenied { uid: 1000 }.code(),
            ErrorCode::PermissionDenied
        );
        assert_eq!(
            ServiceError::BackendTimeout(30).code(),
            ErrorCode::BackendTimeout
        );
    }

    #[test]
    fn test_response_carries_message() {
        let err = ServiceError::InvalidQuery { len: 1, min: 2 };
        let resp = err.to_response();
        assert_eq!(resp.code, ErrorCode::InvalidQuery);
        assert!(resp.message.contains("too short"));
    }
}
