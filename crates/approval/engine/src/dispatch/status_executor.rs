use super::{ExecutionContext, ExecutionReceipt, ExecutionResult, Executor};
use approval_types::{Confirmation, ExecutionFailure, RedemptionSettlement, RequestId};
use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

/// Settles redemption requests.
///
/// There is no external call: the side effect is the terminal status write
/// the coordinator makes with the reference produced here. The reference is
/// a blake3 digest of the request id, the settlement payload, and the sorted
/// approver ids, so re-settling the same approval yields the same reference.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatusExecutor;

impl StatusExecutor {
    pub fn new() -> Self {
        Self
    }

    pub fn settlement_reference(
        request_id: &RequestId,
        settlement: &RedemptionSettlement,
        approvals: &[Confirmation],
    ) -> String {
        let mut approvers = approvals
            .iter()
            .filter(|confirmation| confirmation.is_approval())
            .map(|confirmation| confirmation.approver_id.as_str())
            .collect::<Vec<_>>();
        approvers.sort_unstable();
        approvers.dedup();

        let mut hasher = blake3::Hasher::new();
        hasher.update(b"redemption-settlement:v1\n");
        hasher.update(request_id.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(settlement.beneficiary.as_bytes());
        hasher.update(b"\n");
        hasher.update(settlement.amount.to_string().as_bytes());
        hasher.update(b"\n");
        hasher.update(settlement.asset_type.as_bytes());
        for approver in approvers {
            hasher.update(b"\n");
            hasher.update(approver.as_bytes());
        }
        format!("stl_{}", hasher.finalize().to_hex())
    }
}

#[async_trait]
impl Executor for StatusExecutor {
    type Payload = RedemptionSettlement;

    fn name(&self) -> &'static str {
        "status"
    }

    async fn execute(
        &self,
        context: &ExecutionContext,
        payload: &RedemptionSettlement,
        approvals: &[Confirmation],
    ) -> ExecutionResult {
        let request_id = &context.request_id;
        if payload.beneficiary.trim().is_empty() || payload.asset_type.trim().is_empty() {
            return Err(ExecutionFailure::retryable(
                "settlement is missing beneficiary or asset type",
            ));
        }
        if payload.amount == 0 {
            return Err(ExecutionFailure::retryable("settlement amount is zero"));
        }

        let reference = Self::settlement_reference(request_id, payload, approvals);
        info!(
            request_id = %request_id,
            beneficiary = %payload.beneficiary,
            asset_type = %payload.asset_type,
            reference = %reference,
            "Redemption settled"
        );
        Ok(ExecutionReceipt {
            reference,
            submission: None,
            executed_at: Utc::now(),
        })
    }
}
