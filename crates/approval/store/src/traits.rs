use crate::StorageResult;
use approval_types::{
    ApprovalRequest, ApprovalStatus, Confirmation, DomainKind, RecordedConfirmation, RequestId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Generic query window for paged reads. `limit == 0` means unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryWindow {
    pub limit: usize,
    pub offset: usize,
}

impl QueryWindow {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self { limit, offset }
    }

    pub fn all() -> Self {
        Self::default()
    }
}

/// How a status update treats `failure_reason`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FailureUpdate {
    #[default]
    Keep,
    Set(String),
    Clear,
}

/// Field changes applied together with a status compare-and-swap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusUpdate {
    pub executed_at: Option<DateTime<Utc>>,
    pub execution_reference: Option<String>,
    pub submission_reference: Option<String>,
    pub failure: FailureUpdate,
    /// Increment `execution_attempts`
    pub record_attempt: bool,
    /// Increment `submission_generation`
    pub fresh_submission_key: bool,
    /// Write only if `execution_attempts` still equals this value
    pub expected_attempt: Option<u32>,
}

impl StatusUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn executed(at: DateTime<Utc>, reference: impl Into<String>) -> Self {
        Self {
            executed_at: Some(at),
            execution_reference: Some(reference.into()),
            failure: FailureUpdate::Clear,
            ..Self::default()
        }
    }

    pub fn with_failure(mut self, reason: impl Into<String>) -> Self {
        self.failure = FailureUpdate::Set(reason.into());
        self
    }

    pub fn clear_failure(mut self) -> Self {
        self.failure = FailureUpdate::Clear;
        self
    }

    pub fn with_submission(mut self, submission: Option<String>) -> Self {
        self.submission_reference = submission;
        self
    }

    pub fn with_attempt(mut self) -> Self {
        self.record_attempt = true;
        self
    }

    pub fn with_fresh_submission_key(mut self) -> Self {
        self.fresh_submission_key = true;
        self
    }

    /// Make the write conditional on the execution attempt that produced it.
    pub fn guarded_by(mut self, attempt: u32) -> Self {
        self.expected_attempt = Some(attempt);
        self
    }

    /// Apply the field changes to an in-memory record.
    pub fn apply(&self, request: &mut ApprovalRequest) {
        if let Some(at) = self.executed_at {
            request.executed_at = Some(at);
        }
        if let Some(reference) = &self.execution_reference {
            request.execution_reference = Some(reference.clone());
        }
        if let Some(submission) = &self.submission_reference {
            request.submission_reference = Some(submission.clone());
        }
        match &self.failure {
            FailureUpdate::Keep => {}
            FailureUpdate::Set(reason) => request.failure_reason = Some(reason.clone()),
            FailureUpdate::Clear => request.failure_reason = None,
        }
        if self.record_attempt {
            request.execution_attempts = request.execution_attempts.saturating_add(1);
        }
        if self.fresh_submission_key {
            request.submission_generation = request.submission_generation.saturating_add(1);
        }
    }
}

/// Storage interface for approval request records.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Insert a new request. Fails with `Duplicate` if the id exists.
    async fn create_request(&self, request: ApprovalRequest) -> StorageResult<RequestId>;

    /// Get one request by id.
    async fn get_request(&self, request_id: &RequestId) -> StorageResult<Option<ApprovalRequest>>;

    /// Compare-and-swap the status from `expected` to `new`, applying `update`.
    ///
    /// Returns the stored record after the write, `Conflict` if the current
    /// status differs from `expected`, `StaleAttempt` if `update` is guarded
    /// by an execution attempt that is no longer current, and `NotFound` if
    /// the id is unknown.
    async fn update_status(
        &self,
        request_id: &RequestId,
        expected: ApprovalStatus,
        new: ApprovalStatus,
        update: StatusUpdate,
        updated_at: DateTime<Utc>,
    ) -> StorageResult<ApprovalRequest>;

    /// Non-terminal requests of one domain, oldest first.
    async fn list_pending(
        &self,
        domain: DomainKind,
        window: QueryWindow,
    ) -> StorageResult<Vec<ApprovalRequest>>;
}

/// Storage interface for approver confirmations.
#[async_trait]
pub trait ConfirmationStore: Send + Sync {
    /// Record a decision, superseding the approver's active one if any.
    ///
    /// Fails with `Closed` unless the request is `Pending` or `Approved`
    /// at the moment of the write.
    async fn record_confirmation(
        &self,
        confirmation: Confirmation,
    ) -> StorageResult<RecordedConfirmation>;

    /// Active (non-superseded) confirmations, oldest first.
    async fn active_confirmations(&self, request_id: &RequestId)
        -> StorageResult<Vec<Confirmation>>;

    /// Every confirmation ever recorded for a request, oldest first.
    async fn confirmation_history(
        &self,
        request_id: &RequestId,
    ) -> StorageResult<Vec<Confirmation>>;
}

/// Unified storage bundle used by the approval engine.
pub trait ApprovalStorage: RequestStore + ConfirmationStore + Send + Sync {
    /// Short backend label for health and logs.
    fn backend_label(&self) -> &'static str;
}
