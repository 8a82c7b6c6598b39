//! State machine: the legal status transitions of an approval request
//!
//! Every status write in the coordinator goes through [`StateMachine::check`]
//! before the compare-and-swap is attempted, so an illegal transition is
//! reported as `InvalidTransition` rather than silently stored.

use approval_types::{ApprovalError, ApprovalResult, ApprovalStatus};

/// Transition table for approval requests.
#[derive(Clone, Copy, Debug, Default)]
pub struct StateMachine;

impl StateMachine {
    pub fn new() -> Self {
        Self
    }

    /// Statuses reachable from `from` in one step.
    pub fn successors(from: ApprovalStatus) -> &'static [ApprovalStatus] {
        use ApprovalStatus::*;
        match from {
            Pending => &[Approved, Rejected, Revoked],
            // Back to Pending when a revocation drops approvals below threshold
            Approved => &[Executing, Pending, Revoked],
            // Executing -> Executing records an attempt or an ambiguous outcome in place
            Executing => &[Executed, Approved, Executing],
            Executed | Rejected | Revoked => &[],
        }
    }

    pub fn can_transition(from: ApprovalStatus, to: ApprovalStatus) -> bool {
        Self::successors(from).contains(&to)
    }

    /// Validate a transition before attempting it.
    pub fn check(&self, from: ApprovalStatus, to: ApprovalStatus) -> ApprovalResult<()> {
        if Self::can_transition(from, to) {
            Ok(())
        } else {
            Err(ApprovalError::InvalidTransition { from, to })
        }
    }
}
