//! Ledger network adapters for local runs and tests.

#![deny(unsafe_code)]

use approval_engine::{
    LedgerAction, LedgerNetwork, LedgerReceipt, NetworkError, ReceiptStatus, SubmissionId,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// How a [`MockLedgerNetwork`] answers receipt queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptMode {
    /// Pending for `pending_polls` queries, then confirmed; depth grows by one
    /// per later query.
    Confirm { pending_polls: u64 },
    /// Definitive failure: the action was not applied.
    Fail { reason: String },
    /// Pending forever.
    NeverConfirm,
    /// Receipt lookups error out.
    Unreachable,
}

impl Default for ReceiptMode {
    fn default() -> Self {
        Self::Confirm { pending_polls: 0 }
    }
}

#[derive(Debug, Clone)]
struct SubmissionRecord {
    idempotency_key: String,
    transaction_hash: String,
    block_number: u64,
    polls: u64,
}

#[derive(Debug, Default)]
struct MockState {
    by_key: HashMap<String, SubmissionId>,
    submissions: HashMap<SubmissionId, SubmissionRecord>,
    next_block: u64,
}

/// In-memory ledger network with idempotent submissions.
///
/// Submitting an action whose idempotency key was seen before returns the
/// original submission id and does not count as a new application.
#[derive(Debug)]
pub struct MockLedgerNetwork {
    network_id: String,
    chains: Vec<String>,
    mode: Mutex<ReceiptMode>,
    state: Mutex<MockState>,
    submit_calls: AtomicUsize,
    applied: AtomicUsize,
}

impl MockLedgerNetwork {
    pub fn new(network_id: impl Into<String>, chains: &[&str]) -> Self {
        Self {
            network_id: network_id.into(),
            chains: chains.iter().map(|chain| chain.to_string()).collect(),
            mode: Mutex::new(ReceiptMode::default()),
            state: Mutex::new(MockState {
                next_block: 1,
                ..MockState::default()
            }),
            submit_calls: AtomicUsize::new(0),
            applied: AtomicUsize::new(0),
        }
    }

    pub fn with_mode(self, mode: ReceiptMode) -> Self {
        self.set_mode(mode);
        self
    }

    /// Change receipt behavior for every submission, including earlier ones.
    pub fn set_mode(&self, mode: ReceiptMode) {
        *lock(&self.mode) = mode;
    }

    /// Every call to `submit`, duplicates included.
    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    /// Distinct actions accepted by the ledger.
    pub fn applied_actions(&self) -> usize {
        self.applied.load(Ordering::SeqCst)
    }

    pub fn submission_for(&self, idempotency_key: &str) -> Option<SubmissionId> {
        lock(&self.state).by_key.get(idempotency_key).cloned()
    }

    /// Digest of the action's canonical encoding, as first submitted.
    fn transaction_hash(action: &LedgerAction) -> Result<String, NetworkError> {
        let encoded = action.encode()?;
        let digest = blake3::hash(&encoded).to_hex();
        Ok(format!("0x{}", &digest.as_str()[..40]))
    }
}

#[async_trait]
impl LedgerNetwork for MockLedgerNetwork {
    fn network_id(&self) -> &str {
        &self.network_id
    }

    fn supports(&self, chain_id: &str) -> bool {
        self.chains.iter().any(|chain| chain == chain_id)
    }

    async fn submit(&self, action: &LedgerAction) -> Result<SubmissionId, NetworkError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        if !self.supports(action.chain_id()) {
            return Err(NetworkError::Rejected(format!(
                "chain {} not served by {}",
                action.chain_id(),
                self.network_id
            )));
        }

        let key = action.idempotency_key.clone();
        let mut state = lock(&self.state);
        if let Some(existing) = state.by_key.get(&key) {
            debug!(
                network = %self.network_id,
                key = %key,
                request_id = %action.request_id,
                "Duplicate submission"
            );
            return Ok(existing.clone());
        }

        let transaction_hash = Self::transaction_hash(action)?;
        let sequence = state.submissions.len() + 1;
        let submission = SubmissionId::new(format!("{}-{sequence}", self.network_id));
        let block_number = state.next_block;
        state.next_block += 1;
        state.by_key.insert(key.clone(), submission.clone());
        state.submissions.insert(
            submission.clone(),
            SubmissionRecord {
                idempotency_key: key,
                transaction_hash,
                block_number,
                polls: 0,
            },
        );
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(submission)
    }

    async fn confirmation_count(&self, submission: &SubmissionId) -> Result<u64, NetworkError> {
        let pending_polls = match &*lock(&self.mode) {
            ReceiptMode::Confirm { pending_polls } => *pending_polls,
            _ => return Ok(0),
        };
        let state = lock(&self.state);
        let record = state
            .submissions
            .get(submission)
            .ok_or_else(|| NetworkError::UnknownSubmission(submission.to_string()))?;
        Ok(record.polls.saturating_sub(pending_polls))
    }

    async fn get_receipt(&self, submission: &SubmissionId) -> Result<ReceiptStatus, NetworkError> {
        let mode = lock(&self.mode).clone();
        let mut state = lock(&self.state);
        let record = state
            .submissions
            .get_mut(submission)
            .ok_or_else(|| NetworkError::UnknownSubmission(submission.to_string()))?;
        record.polls += 1;

        match mode {
            ReceiptMode::Confirm { pending_polls } if record.polls > pending_polls => {
                debug!(key = %record.idempotency_key, polls = record.polls, "Receipt confirmed");
                Ok(ReceiptStatus::Confirmed(LedgerReceipt {
                    submission_id: submission.clone(),
                    transaction_hash: record.transaction_hash.clone(),
                    block_number: record.block_number,
                    confirmations: record.polls - pending_polls,
                }))
            }
            ReceiptMode::Confirm { .. } | ReceiptMode::NeverConfirm => Ok(ReceiptStatus::Pending),
            ReceiptMode::Fail { reason } => Ok(ReceiptStatus::Failed { reason }),
            ReceiptMode::Unreachable => Err(NetworkError::Unavailable(format!(
                "{} rpc unreachable",
                self.network_id
            ))),
        }
    }
}

/// Network that refuses every submission, for failure-path tests.
#[derive(Debug, Clone)]
pub struct AlwaysFailNetwork {
    network_id: String,
    reason: String,
}

impl AlwaysFailNetwork {
    pub fn new(network_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            network_id: network_id.into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl LedgerNetwork for AlwaysFailNetwork {
    fn network_id(&self) -> &str {
        &self.network_id
    }

    fn supports(&self, _chain_id: &str) -> bool {
        true
    }

    async fn submit(&self, _action: &LedgerAction) -> Result<SubmissionId, NetworkError> {
        Err(NetworkError::Unavailable(self.reason.clone()))
    }

    async fn confirmation_count(&self, submission: &SubmissionId) -> Result<u64, NetworkError> {
        Err(NetworkError::UnknownSubmission(submission.to_string()))
    }

    async fn get_receipt(&self, submission: &SubmissionId) -> Result<ReceiptStatus, NetworkError> {
        Err(NetworkError::UnknownSubmission(submission.to_string()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicked test thread must not wedge the mock for the others
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
