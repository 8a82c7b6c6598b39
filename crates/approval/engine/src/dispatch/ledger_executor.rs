use super::{ExecutionContext, ExecutionReceipt, ExecutionResult, Executor, Verification};
use crate::config::EngineConfig;
use crate::network::{
    LedgerAction, LedgerNetwork, LedgerNetworkRegistry, LedgerReceipt, NetworkError,
    ReceiptStatus, SubmissionId,
};
use approval_types::{Confirmation, ExecutionFailure, LedgerTransaction};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Submits approved ledger transactions and waits for a final receipt.
///
/// Failure classification:
/// - nothing submitted: retryable
/// - the ledger reports a definitive failure: declined
/// - submitted but no final receipt before the timeout: ambiguous
pub struct LedgerExecutor {
    networks: LedgerNetworkRegistry,
    poll_interval: Duration,
    timeout: Duration,
    required_confirmations: u64,
}

impl LedgerExecutor {
    pub fn new(networks: LedgerNetworkRegistry, config: &EngineConfig) -> Self {
        Self {
            networks,
            poll_interval: config.receipt_poll_interval,
            timeout: config.receipt_timeout,
            required_confirmations: config.required_ledger_confirmations,
        }
    }

    fn network_for(&self, chain_id: &str) -> Result<Arc<dyn LedgerNetwork>, ExecutionFailure> {
        self.networks.resolve(chain_id).ok_or_else(|| {
            ExecutionFailure::retryable(format!("no ledger network registered for chain {chain_id}"))
        })
    }

    /// Final receipt if the submission is included at the required depth.
    async fn settled_receipt(
        &self,
        network: &dyn LedgerNetwork,
        submission: &SubmissionId,
    ) -> Result<Option<LedgerReceipt>, PollError> {
        match network.get_receipt(submission).await {
            Ok(ReceiptStatus::Confirmed(mut receipt)) => {
                if receipt.confirmations < self.required_confirmations {
                    receipt.confirmations = network
                        .confirmation_count(submission)
                        .await
                        .map_err(PollError::Network)?;
                }
                if receipt.confirmations >= self.required_confirmations {
                    Ok(Some(receipt))
                } else {
                    Ok(None)
                }
            }
            Ok(ReceiptStatus::Pending) => Ok(None),
            Ok(ReceiptStatus::Failed { reason }) => Err(PollError::Failed(reason)),
            Err(err) => Err(PollError::Network(err)),
        }
    }

    async fn await_receipt(
        &self,
        network: &dyn LedgerNetwork,
        submission: &SubmissionId,
    ) -> Result<LedgerReceipt, ExecutionFailure> {
        let deadline = Instant::now() + self.timeout;
        let mut last_error: Option<String> = None;

        loop {
            match self.settled_receipt(network, submission).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => {}
                Err(PollError::Failed(reason)) => {
                    return Err(ExecutionFailure::declined(
                        format!("ledger reported failure: {reason}"),
                        Some(submission.to_string()),
                    ))
                }
                Err(PollError::Network(NetworkError::UnknownSubmission(detail))) => {
                    return Err(ExecutionFailure::ambiguous(
                        format!("ledger lost track of submission: {detail}"),
                        Some(submission.to_string()),
                    ))
                }
                Err(PollError::Network(err)) => {
                    debug!(submission = %submission, error = %err, "Receipt poll failed");
                    last_error = Some(err.to_string());
                }
            }

            if Instant::now() >= deadline {
                let reason = match last_error {
                    Some(err) => format!(
                        "no final receipt within {:?} (last error: {err})",
                        self.timeout
                    ),
                    None => format!("no final receipt within {:?}", self.timeout),
                };
                return Err(ExecutionFailure::ambiguous(
                    reason,
                    Some(submission.to_string()),
                ));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

enum PollError {
    Failed(String),
    Network(NetworkError),
}

#[async_trait]
impl Executor for LedgerExecutor {
    type Payload = LedgerTransaction;

    fn name(&self) -> &'static str {
        "ledger"
    }

    async fn execute(
        &self,
        context: &ExecutionContext,
        payload: &LedgerTransaction,
        approvals: &[Confirmation],
    ) -> ExecutionResult {
        let request_id = &context.request_id;
        let network = self.network_for(&payload.chain_id)?;
        let action = LedgerAction::new(
            request_id.clone(),
            context.idempotency_key.clone(),
            payload.clone(),
            approvals,
            Utc::now(),
        );

        let submission = network.submit(&action).await.map_err(|err| {
            warn!(
                request_id = %request_id,
                chain_id = %payload.chain_id,
                error = %err,
                "Ledger submission failed"
            );
            ExecutionFailure::retryable(format!("submission failed: {err}"))
        })?;

        info!(
            request_id = %request_id,
            network = network.network_id(),
            idempotency_key = %action.idempotency_key,
            submission = %submission,
            "Ledger action submitted"
        );

        let receipt = self.await_receipt(network.as_ref(), &submission).await?;
        info!(
            request_id = %request_id,
            transaction_hash = %receipt.transaction_hash,
            block = receipt.block_number,
            confirmations = receipt.confirmations,
            "Ledger action confirmed"
        );

        Ok(ExecutionReceipt {
            reference: receipt.transaction_hash,
            submission: Some(submission.0),
            executed_at: Utc::now(),
        })
    }

    async fn verify(
        &self,
        context: &ExecutionContext,
        payload: &LedgerTransaction,
        submission: Option<&str>,
    ) -> Result<Verification, ExecutionFailure> {
        let Some(submission) = submission else {
            debug!(request_id = %context.request_id, "No submission recorded; nothing to verify");
            return Ok(Verification::Unknown);
        };
        let network = self.network_for(&payload.chain_id)?;
        let submission = SubmissionId::new(submission);

        match self.settled_receipt(network.as_ref(), &submission).await {
            Ok(Some(receipt)) => Ok(Verification::Applied(ExecutionReceipt {
                reference: receipt.transaction_hash,
                submission: Some(submission.0),
                executed_at: Utc::now(),
            })),
            Ok(None) => Ok(Verification::Unknown),
            Err(PollError::Failed(reason)) => Ok(Verification::NotApplied {
                reason: format!("ledger reported failure: {reason}"),
            }),
            Err(PollError::Network(err)) => Err(ExecutionFailure::ambiguous(
                format!("receipt lookup failed: {err}"),
                Some(submission.0),
            )),
        }
    }
}
