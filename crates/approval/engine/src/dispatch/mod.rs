//! Execution dispatch
//!
//! The dispatcher selects an executor by the request's domain. It assumes the
//! caller already holds the execution guard (status `Executing`); it never
//! touches request status itself.

mod ledger_executor;
mod status_executor;

pub use ledger_executor::LedgerExecutor;
pub use status_executor::StatusExecutor;

use crate::config::EngineConfig;
use crate::network::LedgerNetworkRegistry;
use approval_types::{
    ApprovalRequest, Confirmation, ExecutionFailure, LedgerTransaction, RedemptionSettlement,
    RequestDomain, RequestId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Proof that a side effect was applied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReceipt {
    /// Receipt hash or settlement reference
    pub reference: String,
    /// Ledger submission handle, when the executor submitted anything
    pub submission: Option<String>,
    pub executed_at: DateTime<Utc>,
}

pub type ExecutionResult = Result<ExecutionReceipt, ExecutionFailure>;

/// Identity of one execution attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionContext {
    pub request_id: RequestId,
    /// Value of `execution_attempts` for this dispatch
    pub attempt: u32,
    /// Key the external system deduplicates submissions on
    pub idempotency_key: String,
}

impl ExecutionContext {
    pub fn for_request(request: &ApprovalRequest) -> Self {
        Self {
            request_id: request.id.clone(),
            attempt: request.execution_attempts,
            idempotency_key: request.idempotency_key(),
        }
    }
}

/// Result of checking an earlier execution against the external system.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verification {
    /// The side effect is in place
    Applied(ExecutionReceipt),
    /// The external system definitively did not apply it
    NotApplied { reason: String },
    /// Nothing conclusive yet
    Unknown,
}

/// Performs the side effect for one domain payload.
#[async_trait]
pub trait Executor: Send + Sync {
    type Payload: Send + Sync;

    fn name(&self) -> &'static str;

    /// Apply the side effect. `approvals` are the active confirmations that
    /// carried the request over its threshold.
    async fn execute(
        &self,
        context: &ExecutionContext,
        payload: &Self::Payload,
        approvals: &[Confirmation],
    ) -> ExecutionResult;

    /// Check the outcome of an earlier, ambiguous execution.
    async fn verify(
        &self,
        _context: &ExecutionContext,
        _payload: &Self::Payload,
        _submission: Option<&str>,
    ) -> Result<Verification, ExecutionFailure> {
        Ok(Verification::Unknown)
    }
}

/// Routes requests to the executor for their domain.
#[derive(Clone)]
pub struct ExecutionDispatcher {
    ledger: Arc<dyn Executor<Payload = LedgerTransaction>>,
    settlement: Arc<dyn Executor<Payload = RedemptionSettlement>>,
}

impl ExecutionDispatcher {
    pub fn new(
        ledger: Arc<dyn Executor<Payload = LedgerTransaction>>,
        settlement: Arc<dyn Executor<Payload = RedemptionSettlement>>,
    ) -> Self {
        Self { ledger, settlement }
    }

    /// Default executors: ledger transactions go to `networks`, redemption
    /// settlements are settled locally.
    pub fn with_networks(networks: LedgerNetworkRegistry, config: &EngineConfig) -> Self {
        Self::new(
            Arc::new(LedgerExecutor::new(networks, config)),
            Arc::new(StatusExecutor::new()),
        )
    }

    pub async fn dispatch(
        &self,
        request: &ApprovalRequest,
        approvals: &[Confirmation],
    ) -> ExecutionResult {
        let context = ExecutionContext::for_request(request);
        match &request.domain {
            RequestDomain::LedgerTransaction(tx) => {
                debug!(
                    request_id = %request.id,
                    executor = self.ledger.name(),
                    attempt = context.attempt,
                    idempotency_key = %context.idempotency_key,
                    "Dispatching"
                );
                self.ledger.execute(&context, tx, approvals).await
            }
            RequestDomain::RedemptionSettlement(settlement) => {
                debug!(
                    request_id = %request.id,
                    executor = self.settlement.name(),
                    attempt = context.attempt,
                    "Dispatching"
                );
                self.settlement
                    .execute(&context, settlement, approvals)
                    .await
            }
        }
    }

    pub async fn verify(&self, request: &ApprovalRequest) -> Result<Verification, ExecutionFailure> {
        let context = ExecutionContext::for_request(request);
        let submission = request.submission_reference.as_deref();
        match &request.domain {
            RequestDomain::LedgerTransaction(tx) => {
                self.ledger.verify(&context, tx, submission).await
            }
            RequestDomain::RedemptionSettlement(settlement) => {
                self.settlement
                    .verify(&context, settlement, submission)
                    .await
            }
        }
    }
}
