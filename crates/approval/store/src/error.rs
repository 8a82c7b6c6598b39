use approval_types::{ApprovalError, ApprovalStatus, RequestId};
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage-layer errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(String),

    /// Compare-and-swap lost: the record's status is no longer the expected one.
    #[error("status conflict on {request_id}: expected {expected}, found {found}")]
    Conflict {
        request_id: RequestId,
        expected: ApprovalStatus,
        found: ApprovalStatus,
    },

    /// Guarded write from an execution attempt that has been superseded.
    #[error("stale execution attempt on {request_id}: expected {expected}, found {found}")]
    StaleAttempt {
        request_id: RequestId,
        expected: u32,
        found: u32,
    },

    /// Confirmation write against a request that no longer accepts decisions.
    #[error("request {request_id} is closed to decisions (status: {status})")]
    Closed {
        request_id: RequestId,
        status: ApprovalStatus,
    },

    #[error("duplicate record: {0}")]
    Duplicate(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<StorageError> for ApprovalError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict {
                request_id,
                expected,
                found,
            } => ApprovalError::Conflict {
                request_id,
                expected,
                found,
            },
            StorageError::StaleAttempt {
                request_id,
                expected,
                found,
            } => ApprovalError::StaleExecution {
                request_id,
                attempt: expected,
                current: found,
            },
            StorageError::Closed { request_id, status } => {
                ApprovalError::RequestNotPending { request_id, status }
            }
            StorageError::NotFound(id) => ApprovalError::NotFound(RequestId::new(id)),
            other => ApprovalError::Storage(other.to_string()),
        }
    }
}
