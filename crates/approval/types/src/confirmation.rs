//! Approver confirmations

use crate::{ApproverId, ConfirmationId, RequestId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An approver's decision on a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One approver's recorded decision.
///
/// Confirmations are never deleted. When the same approver decides again the
/// earlier record is stamped with `superseded_at`/`superseded_by` and stops
/// counting towards the threshold.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub id: ConfirmationId,
    pub request_id: RequestId,
    pub approver_id: ApproverId,
    pub decision: Decision,
    /// Opaque signature or attestation supplied by the approver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<Vec<u8>>,
    /// Free-text reason, typically given with a rejection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<ConfirmationId>,
}

impl Confirmation {
    pub fn new(
        request_id: RequestId,
        approver_id: ApproverId,
        decision: Decision,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ConfirmationId::generate(),
            request_id,
            approver_id,
            decision,
            proof: None,
            note: None,
            timestamp,
            superseded_at: None,
            superseded_by: None,
        }
    }

    pub fn with_proof(mut self, proof: Vec<u8>) -> Self {
        self.proof = Some(proof);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn is_active(&self) -> bool {
        self.superseded_at.is_none()
    }

    pub fn is_approval(&self) -> bool {
        self.decision == Decision::Approve
    }

    /// Mark this record as replaced by `successor`.
    pub fn supersede(&mut self, successor: &ConfirmationId, at: DateTime<Utc>) {
        self.superseded_at = Some(at);
        self.superseded_by = Some(successor.clone());
    }
}

/// Result of writing a confirmation: the new record and the one it replaced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedConfirmation {
    pub confirmation: Confirmation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded: Option<Confirmation>,
}
