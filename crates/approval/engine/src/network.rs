//! Ledger network adapter contract
//!
//! The engine never speaks a chain's wire format. It hands a [`LedgerAction`]
//! to whichever [`LedgerNetwork`] is registered for the transaction's chain
//! and then polls for a receipt.

use approval_types::{ApproverId, Confirmation, LedgerTransaction, RequestId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Handle returned by a ledger network for a submitted action.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(pub String);

impl SubmissionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An approver's signature carried with a ledger action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSignature {
    pub approver_id: ApproverId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<Vec<u8>>,
}

/// What gets submitted to a ledger network.
///
/// A network that sees the same `idempotency_key` twice must return the
/// original submission instead of applying the action again. The key stays
/// fixed across retries of one request and changes only after the ledger
/// declined the previous action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAction {
    pub request_id: RequestId,
    pub idempotency_key: String,
    pub transaction: LedgerTransaction,
    pub signatures: Vec<ActionSignature>,
    pub prepared_at: DateTime<Utc>,
}

impl LedgerAction {
    /// Build an action from a transaction and the approvals that carried it.
    pub fn new(
        request_id: RequestId,
        idempotency_key: impl Into<String>,
        transaction: LedgerTransaction,
        approvals: &[Confirmation],
        prepared_at: DateTime<Utc>,
    ) -> Self {
        let signatures = approvals
            .iter()
            .filter(|confirmation| confirmation.is_approval())
            .map(|confirmation| ActionSignature {
                approver_id: confirmation.approver_id.clone(),
                proof: confirmation.proof.clone(),
            })
            .collect();
        Self {
            request_id,
            idempotency_key: idempotency_key.into(),
            transaction,
            signatures,
            prepared_at,
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.transaction.chain_id
    }

    /// Canonical JSON encoding that adapters sign or hash.
    pub fn encode(&self) -> Result<Vec<u8>, NetworkError> {
        serde_json::to_vec(self).map_err(|e| NetworkError::Encoding(e.to_string()))
    }
}

/// Final record of an applied action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerReceipt {
    pub submission_id: SubmissionId,
    pub transaction_hash: String,
    pub block_number: u64,
    pub confirmations: u64,
}

/// Ledger-side state of a submission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReceiptStatus {
    /// Included in the ledger
    Confirmed(LedgerReceipt),
    /// Known but not yet included
    Pending,
    /// The ledger refused or reverted the action; it was not applied
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("ledger network unavailable: {0}")]
    Unavailable(String),

    #[error("ledger rejected submission: {0}")]
    Rejected(String),

    #[error("unknown submission: {0}")]
    UnknownSubmission(String),

    #[error("action encoding failed: {0}")]
    Encoding(String),
}

/// Adapter for one ledger network.
#[async_trait]
pub trait LedgerNetwork: Send + Sync {
    fn network_id(&self) -> &str;

    fn supports(&self, chain_id: &str) -> bool;

    async fn submit(&self, action: &LedgerAction) -> Result<SubmissionId, NetworkError>;

    async fn confirmation_count(&self, submission: &SubmissionId) -> Result<u64, NetworkError>;

    async fn get_receipt(&self, submission: &SubmissionId) -> Result<ReceiptStatus, NetworkError>;
}

/// Registry of ledger networks, looked up by chain id.
#[derive(Default, Clone)]
pub struct LedgerNetworkRegistry {
    networks: Vec<Arc<dyn LedgerNetwork>>,
}

impl LedgerNetworkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, network: Arc<dyn LedgerNetwork>) {
        self.networks
            .retain(|existing| existing.network_id() != network.network_id());
        self.networks.push(network);
    }

    pub fn with(mut self, network: Arc<dyn LedgerNetwork>) -> Self {
        self.register(network);
        self
    }

    /// First registered network that supports `chain_id`.
    pub fn resolve(&self, chain_id: &str) -> Option<Arc<dyn LedgerNetwork>> {
        self.networks
            .iter()
            .find(|network| network.supports(chain_id))
            .cloned()
    }

    pub fn has(&self, chain_id: &str) -> bool {
        self.resolve(chain_id).is_some()
    }

    pub fn network_ids(&self) -> Vec<String> {
        self.networks
            .iter()
            .map(|network| network.network_id().to_string())
            .collect()
    }
}
