//! Error types for the approval layer

use crate::{ApprovalStatus, ApproverId, RequestId};
use serde::{Deserialize, Serialize};

/// Why an execution attempt did not complete.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionFailure {
    /// Nothing was applied by the external system. Safe to dispatch again
    /// under the same idempotency key.
    #[error("retryable execution failure: {reason}")]
    Retryable { reason: String },

    /// The external system processed the action and definitively declined
    /// it. A new dispatch must use a fresh idempotency key, or it would be
    /// answered with the declined submission again.
    #[error("execution declined: {reason}")]
    Declined {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        submission: Option<String>,
    },

    /// The action may or may not have been applied. Must be reconciled,
    /// never retried automatically.
    #[error("ambiguous execution outcome: {reason}")]
    Ambiguous {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        submission: Option<String>,
    },
}

impl ExecutionFailure {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::Retryable {
            reason: reason.into(),
        }
    }

    pub fn declined(reason: impl Into<String>, submission: Option<String>) -> Self {
        Self::Declined {
            reason: reason.into(),
            submission,
        }
    }

    pub fn ambiguous(reason: impl Into<String>, submission: Option<String>) -> Self {
        Self::Ambiguous {
            reason: reason.into(),
            submission,
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Ambiguous { .. })
    }

    /// Text recorded in `ApprovalRequest::failure_reason`.
    pub fn failure_reason(&self) -> String {
        match self {
            Self::Retryable { reason } | Self::Declined { reason, .. } => reason.clone(),
            Self::Ambiguous { reason, .. } => format!("ambiguous: {reason}"),
        }
    }
}

/// Errors that can occur in approval operations
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Approval request not found: {0}")]
    NotFound(RequestId),

    #[error("Approver {approver_id} is not designated for request {request_id}")]
    NotDesignatedApprover {
        request_id: RequestId,
        approver_id: ApproverId,
    },

    #[error("Request {request_id} is not accepting decisions (status: {status})")]
    RequestNotPending {
        request_id: RequestId,
        status: ApprovalStatus,
    },

    #[error("Actor {actor_id} did not originate request {request_id}")]
    NotOriginator {
        request_id: RequestId,
        actor_id: ApproverId,
    },

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: ApprovalStatus,
        to: ApprovalStatus,
    },

    #[error("Conflict on request {request_id}: expected {expected}, found {found}")]
    Conflict {
        request_id: RequestId,
        expected: ApprovalStatus,
        found: ApprovalStatus,
    },

    #[error("Request {request_id} is not approved for execution (status: {status})")]
    NotApproved {
        request_id: RequestId,
        status: ApprovalStatus,
    },

    /// The execution guard for `attempt` was superseded by a later attempt.
    #[error("Execution attempt {attempt} of request {request_id} is stale (current attempt: {current})")]
    StaleExecution {
        request_id: RequestId,
        attempt: u32,
        current: u32,
    },

    #[error("Execution failed: {0}")]
    Execution(#[from] ExecutionFailure),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Result type alias for approval operations
pub type ApprovalResult<T> = Result<T, ApprovalError>;
