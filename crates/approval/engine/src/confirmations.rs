//! Confirmation ledger
//!
//! Append-only record of approver decisions. A new decision from an approver
//! supersedes their previous one; nothing is ever deleted.

use approval_store::ApprovalStorage;
use approval_types::{
    ApprovalError, ApprovalRequest, ApprovalResult, ApproverId, Confirmation, Decision,
    RecordedConfirmation, RequestId,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// One approver decision as submitted by a caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmInput {
    pub approver_id: ApproverId,
    pub decision: Decision,
    #[serde(default)]
    pub proof: Option<Vec<u8>>,
    #[serde(default)]
    pub note: Option<String>,
}

impl ConfirmInput {
    pub fn new(approver_id: impl Into<ApproverId>, decision: Decision) -> Self {
        Self {
            approver_id: approver_id.into(),
            decision,
            proof: None,
            note: None,
        }
    }

    pub fn approve(approver_id: impl Into<ApproverId>) -> Self {
        Self::new(approver_id, Decision::Approve)
    }

    pub fn reject(approver_id: impl Into<ApproverId>) -> Self {
        Self::new(approver_id, Decision::Reject)
    }

    pub fn with_proof(mut self, proof: Vec<u8>) -> Self {
        self.proof = Some(proof);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Records and reads approver confirmations.
#[derive(Clone)]
pub struct ConfirmationLedger {
    storage: Arc<dyn ApprovalStorage>,
}

impl ConfirmationLedger {
    pub fn new(storage: Arc<dyn ApprovalStorage>) -> Self {
        Self { storage }
    }

    /// Record a decision on `request`.
    ///
    /// Fails with `NotDesignatedApprover` for outsiders and with
    /// `RequestNotPending` once the request is executing or terminal. The
    /// status check is repeated by the store inside the write itself.
    pub async fn record(
        &self,
        request: &ApprovalRequest,
        input: ConfirmInput,
    ) -> ApprovalResult<RecordedConfirmation> {
        if !request.is_designated(&input.approver_id) {
            return Err(ApprovalError::NotDesignatedApprover {
                request_id: request.id.clone(),
                approver_id: input.approver_id,
            });
        }
        if !request.status.accepts_decisions() {
            return Err(ApprovalError::RequestNotPending {
                request_id: request.id.clone(),
                status: request.status,
            });
        }

        let mut confirmation = Confirmation::new(
            request.id.clone(),
            input.approver_id,
            input.decision,
            Utc::now(),
        );
        confirmation.proof = input.proof;
        confirmation.note = input.note;

        let recorded = self.storage.record_confirmation(confirmation).await?;
        debug!(
            request_id = %request.id,
            approver_id = %recorded.confirmation.approver_id,
            decision = %recorded.confirmation.decision,
            superseded = recorded.superseded.is_some(),
            "Confirmation recorded"
        );
        Ok(recorded)
    }

    pub async fn active_confirmations_for(
        &self,
        request_id: &RequestId,
    ) -> ApprovalResult<Vec<Confirmation>> {
        Ok(self.storage.active_confirmations(request_id).await?)
    }

    /// Every decision ever recorded, superseded ones included.
    pub async fn history_for(&self, request_id: &RequestId) -> ApprovalResult<Vec<Confirmation>> {
        Ok(self.storage.confirmation_history(request_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approval_store::{InMemoryApprovalStorage, RequestStore};
    use approval_types::{
        ApprovalStatus, NewApprovalRequest, RedemptionSettlement, RequestDomain,
    };

    async fn setup() -> (ConfirmationLedger, Arc<InMemoryApprovalStorage>, ApprovalRequest) {
        let storage = Arc::new(InMemoryApprovalStorage::new());
        let request = ApprovalRequest::from_new(
            NewApprovalRequest::new(
                RequestDomain::RedemptionSettlement(RedemptionSettlement {
                    beneficiary: "investor-3".to_string(),
                    amount: 500,
                    asset_type: "BOND-A".to_string(),
                }),
                2,
                vec![ApproverId::new("a"), ApproverId::new("b")],
                ApproverId::new("ops"),
            ),
            Utc::now(),
        );
        storage.create_request(request.clone()).await.unwrap();
        (ConfirmationLedger::new(storage.clone()), storage, request)
    }

    #[tokio::test]
    async fn outsider_is_refused() {
        let (ledger, _, request) = setup().await;
        let err = ledger
            .record(&request, ConfirmInput::approve("mallory"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::NotDesignatedApprover { .. }));
        assert!(ledger.history_for(&request.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn approve_then_reject_leaves_one_active_reject() {
        let (ledger, _, request) = setup().await;
        ledger
            .record(&request, ConfirmInput::approve("a").with_proof(vec![9]))
            .await
            .unwrap();
        let second = ledger
            .record(&request, ConfirmInput::reject("a").with_note("amount mismatch"))
            .await
            .unwrap();
        assert!(second.superseded.is_some());

        let active = ledger.active_confirmations_for(&request.id).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].decision, Decision::Reject);
        assert_eq!(active[0].note.as_deref(), Some("amount mismatch"));
        assert_eq!(ledger.history_for(&request.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stale_snapshot_is_caught_by_the_store() {
        let (ledger, storage, request) = setup().await;
        storage
            .update_status(
                &request.id,
                ApprovalStatus::Pending,
                ApprovalStatus::Revoked,
                Default::default(),
                Utc::now(),
            )
            .await
            .unwrap();

        // `request` still says Pending; the store refuses anyway
        let err = ledger
            .record(&request, ConfirmInput::approve("a"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ApprovalError::RequestNotPending {
                status: ApprovalStatus::Revoked,
                ..
            }
        ));
    }
}
