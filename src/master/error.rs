//! Error types for master operations.

use thiserror::Error;

/// Result type for master operations.
pub type Result<T> = std::result::Result<T, MasterError>;

/// Errors surfaced by the token master.
///
/// Every failure a client can observe maps onto one of the four wire codes
/// plus a retryable not-ready state reported while the master is still
/// rebuilding its index from the store.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MasterError {
    /// A token version precondition was violated.
    #[error("version conflict: {0}")]
    VersionConflict(String),

    /// A referenced token does not exist.
    #[error("token not found: {0}")]
    NotFound(String),

    /// The request itself is malformed.
    #[error("input error: {0}")]
    InputError(String),

    /// The master is recovering and not serving requests yet.
    #[error("master is not ready")]
    NotReady,

    /// Anything else, including transport and persistence failures.  The
    /// operation may or may not have applied.
    #[error("{0}")]
    Unknown(String),
}

impl MasterError {
    /// True for errors worth retrying without changing the request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MasterError::NotReady | MasterError::Unknown(_))
    }
}

impl From<MasterError> for tonic::Status {
    fn from(err: MasterError) -> Self {
        match &err {
            MasterError::VersionConflict(msg) => tonic::Status::aborted(msg.clone()),
            MasterError::NotFound(msg) => tonic::Status::not_found(msg.clone()),
            MasterError::InputError(msg) => tonic::Status::invalid_argument(msg.clone()),
            MasterError::NotReady => tonic::Status::unavailable("master is not ready"),
            MasterError::Unknown(msg) => tonic::Status::unknown(msg.clone()),
        }
    }
}

impl From<tonic::Status> for MasterError {
    fn from(status: tonic::Status) -> Self {
        let msg = status.message().to_string();
        match status.code() {
            tonic::Code::Aborted => MasterError::VersionConflict(msg),
            tonic::Code::NotFound => MasterError::NotFound(msg),
            tonic::Code::InvalidArgument => MasterError::InputError(msg),
            tonic::Code::Unavailable => MasterError::NotReady,
            _ => MasterError::Unknown(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        let errors = vec![
            MasterError::VersionConflict("token /a changed".to_string()),
            MasterError::NotFound("token /a not found".to_string()),
            MasterError::InputError("empty name".to_string()),
            MasterError::NotReady,
        ];
        for err in errors {
            let status: tonic::Status = err.clone().into();
            assert_eq!(MasterError::from(status), err);
        }
    }

    #[test]
    fn test_retryable() {
        assert!(MasterError::NotReady.is_retryable());
        assert!(MasterError::Unknown("store hiccup".to_string()).is_retryable());
        assert!(!MasterError::VersionConflict("v1 != v2".to_string()).is_retryable());
    }
}
