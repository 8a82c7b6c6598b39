//! Workflow coordinator: the only writer of request status
//!
//! Every status change is a compare-and-swap on the store, validated by the
//! [`StateMachine`] first. After each confirmation the coordinator re-reads
//! the request and its active confirmations, evaluates the threshold, and
//! moves the status towards the evaluated outcome. A lost swap means someone
//! else moved the request; the coordinator re-reads and tries again.
//!
//! Exactly-once execution rests on the `Approved -> Executing` swap: only the
//! caller that wins it dispatches. Once `Executing`, the store refuses new
//! confirmations, so the winner re-evaluates a frozen snapshot before handing
//! the request to the dispatcher.
//!
//! Each dispatcher invocation bumps `execution_attempts`, and the write that
//! records its result is guarded by that attempt number. A result that
//! arrives after the request was settled some other way cannot overwrite it.

use crate::config::EngineConfig;
use crate::confirmations::{ConfirmInput, ConfirmationLedger};
use crate::dispatch::{ExecutionDispatcher, ExecutionResult, Verification};
use crate::notify::{NotificationSink, TracingNotificationSink};
use crate::state_machine::StateMachine;
use crate::threshold::{evaluate_request, ThresholdOutcome};
use approval_store::{ApprovalStorage, QueryWindow, StatusUpdate};
use approval_types::{
    ActorId, ApprovalError, ApprovalRequest, ApprovalResult, ApprovalStatus, Confirmation,
    DomainKind, ExecutionFailure, NewApprovalRequest, RequestId, StatusTransition,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What a dispatch call did.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// This call executed the request
    Executed { reference: String },
    /// Someone executed it earlier
    AlreadyExecuted { reference: Option<String> },
    /// Another caller holds the execution guard
    InProgress,
    /// Nothing was applied, or the external system declined the action;
    /// the request is back in `Approved`
    Failed { reason: String, attempts: u32 },
    /// Outcome unknown; the request stays `Executing` until reconciled
    Ambiguous {
        reason: String,
        submission: Option<String>,
    },
    /// The threshold no longer held once the guard was taken; nothing ran
    Released { status: ApprovalStatus },
}

/// Operator decision for an execution that cannot be reconciled automatically.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resolution", rename_all = "snake_case")]
pub enum Resolution {
    /// The side effect happened; record its reference.
    Executed { reference: String },
    /// The side effect did not happen; the request may be dispatched again.
    NotExecuted,
}

/// Coordinates confirmations, threshold evaluation, and execution.
pub struct WorkflowCoordinator {
    storage: Arc<dyn ApprovalStorage>,
    confirmations: ConfirmationLedger,
    dispatcher: ExecutionDispatcher,
    machine: StateMachine,
    sink: Arc<dyn NotificationSink>,
    config: EngineConfig,
}

impl WorkflowCoordinator {
    pub fn new(
        storage: Arc<dyn ApprovalStorage>,
        dispatcher: ExecutionDispatcher,
        config: EngineConfig,
    ) -> Self {
        Self {
            confirmations: ConfirmationLedger::new(storage.clone()),
            storage,
            dispatcher,
            machine: StateMachine::new(),
            sink: Arc::new(TracingNotificationSink),
            config,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend_label(&self) -> &'static str {
        self.storage.backend_label()
    }

    /// Validate and persist a new request in `Pending`.
    ///
    /// A threshold that can never be met (more required approvals than
    /// designated approvers) is stored and immediately settled to `Rejected`.
    pub async fn create_request(&self, new: NewApprovalRequest) -> ApprovalResult<RequestId> {
        new.validate()?;
        let request = ApprovalRequest::from_new(new, Utc::now());
        let request_id = self.storage.create_request(request.clone()).await?;

        info!(
            request_id = %request_id,
            domain = %request.kind(),
            required = request.required_approvals,
            approvers = request.designated_approvers.len(),
            created_by = %request.created_by,
            "Approval request created"
        );

        if evaluate_request(&request, &[]).outcome == ThresholdOutcome::Rejected {
            warn!(
                request_id = %request_id,
                required = request.required_approvals,
                approvers = request.designated_approvers.len(),
                "Threshold unreachable at creation"
            );
            self.settle(&request_id).await?;
        }

        Ok(request_id)
    }

    /// Record an approver's decision and settle the request status.
    ///
    /// With `auto_dispatch` enabled, crossing the threshold dispatches the
    /// request before returning. Execution problems do not fail the
    /// confirmation; they show up in the returned status.
    pub async fn confirm(
        &self,
        request_id: &RequestId,
        input: ConfirmInput,
    ) -> ApprovalResult<ApprovalStatus> {
        let request = self.load(request_id).await?;
        self.confirmations.record(&request, input).await?;
        let settled = self.settle(request_id).await?;

        if settled.status == ApprovalStatus::Approved && self.config.auto_dispatch {
            self.auto_dispatch(&settled).await;
            return Ok(self.load(request_id).await?.status);
        }
        Ok(settled.status)
    }

    /// Withdraw a request. Only its originator may do this, and only before
    /// execution starts. Withdrawing an already revoked request is a no-op.
    pub async fn withdraw(
        &self,
        request_id: &RequestId,
        actor_id: &ActorId,
    ) -> ApprovalResult<ApprovalStatus> {
        let mut conflicts = 0;
        loop {
            let request = self.load(request_id).await?;
            if &request.created_by != actor_id {
                return Err(ApprovalError::NotOriginator {
                    request_id: request_id.clone(),
                    actor_id: actor_id.clone(),
                });
            }

            match request.status {
                ApprovalStatus::Revoked => return Ok(ApprovalStatus::Revoked),
                ApprovalStatus::Pending | ApprovalStatus::Approved => {}
                status => {
                    return Err(ApprovalError::RequestNotPending {
                        request_id: request_id.clone(),
                        status,
                    })
                }
            }

            match self
                .transition(&request, ApprovalStatus::Revoked, StatusUpdate::new())
                .await
            {
                Ok(updated) => {
                    info!(request_id = %request_id, actor_id = %actor_id, "Request withdrawn");
                    return Ok(updated.status);
                }
                Err(err @ ApprovalError::Conflict { .. }) => {
                    conflicts += 1;
                    if conflicts > self.config.max_transition_retries {
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn get_status(&self, request_id: &RequestId) -> ApprovalResult<ApprovalRequest> {
        self.load(request_id).await
    }

    /// Non-terminal requests of one domain, oldest first.
    pub async fn list_pending(
        &self,
        domain: DomainKind,
        window: QueryWindow,
    ) -> ApprovalResult<Vec<ApprovalRequest>> {
        Ok(self.storage.list_pending(domain, window).await?)
    }

    /// Confirmations of a request; superseded ones only when asked for.
    pub async fn confirmations(
        &self,
        request_id: &RequestId,
        include_superseded: bool,
    ) -> ApprovalResult<Vec<Confirmation>> {
        self.load(request_id).await?;
        if include_superseded {
            self.confirmations.history_for(request_id).await
        } else {
            self.confirmations.active_confirmations_for(request_id).await
        }
    }

    /// Execute an approved request, at most once.
    pub async fn dispatch(&self, request_id: &RequestId) -> ApprovalResult<DispatchOutcome> {
        let request = self.load(request_id).await?;
        match request.status {
            ApprovalStatus::Approved => {}
            ApprovalStatus::Executed => {
                return Ok(DispatchOutcome::AlreadyExecuted {
                    reference: request.execution_reference,
                })
            }
            ApprovalStatus::Executing => return Ok(in_flight(&request)),
            status => {
                return Err(ApprovalError::NotApproved {
                    request_id: request_id.clone(),
                    status,
                })
            }
        }

        let guarded = match self
            .transition(
                &request,
                ApprovalStatus::Executing,
                StatusUpdate::new().clear_failure(),
            )
            .await
        {
            Ok(guarded) => guarded,
            Err(ApprovalError::Conflict { found, .. }) => {
                debug!(request_id = %request_id, found = %found, "Lost execution guard");
                return self.observed_after_lost_guard(request_id).await;
            }
            Err(err) => return Err(err),
        };

        let active = self.storage.active_confirmations(request_id).await?;
        let evaluation = evaluate_request(&guarded, &active);
        if evaluation.outcome != ThresholdOutcome::Approved {
            warn!(
                request_id = %request_id,
                approvals = evaluation.tally.approvals,
                required = guarded.required_approvals,
                "Threshold no longer met under execution guard; releasing"
            );
            let released = self
                .transition(&guarded, ApprovalStatus::Approved, StatusUpdate::new())
                .await?;
            let settled = self.settle(&released.id).await?;
            return Ok(DispatchOutcome::Released {
                status: settled.status,
            });
        }

        let guarded = self
            .transition(
                &guarded,
                ApprovalStatus::Executing,
                StatusUpdate::new().with_attempt(),
            )
            .await?;

        info!(
            request_id = %request_id,
            domain = %guarded.kind(),
            attempt = guarded.execution_attempts,
            "Executing approved request"
        );
        let result = self.dispatcher.dispatch(&guarded, &active).await;
        self.apply_execution_result(&guarded, result).await
    }

    /// Check an executing request against the external system.
    ///
    /// Applied moves it to `Executed`, a definitive failure back to
    /// `Approved` under a fresh idempotency key; an inconclusive answer
    /// leaves it unchanged. Only ambiguous executions, or ones whose guard
    /// outlived `execution_lease`, can be reconciled.
    pub async fn reconcile(&self, request_id: &RequestId) -> ApprovalResult<ApprovalRequest> {
        let request = self.load(request_id).await?;
        if request.status == ApprovalStatus::Executed {
            return Ok(request);
        }
        self.ensure_settleable(&request, ApprovalStatus::Executed)?;
        let attempt = request.execution_attempts;

        match self.dispatcher.verify(&request).await? {
            Verification::Applied(receipt) => {
                info!(
                    request_id = %request_id,
                    reference = %receipt.reference,
                    "Reconciled: execution applied"
                );
                self.transition(
                    &request,
                    ApprovalStatus::Executed,
                    StatusUpdate::executed(receipt.executed_at, receipt.reference)
                        .with_submission(receipt.submission)
                        .guarded_by(attempt),
                )
                .await
            }
            Verification::NotApplied { reason } => {
                warn!(request_id = %request_id, reason = %reason, "Reconciled: execution not applied");
                self.transition(
                    &request,
                    ApprovalStatus::Approved,
                    StatusUpdate::new()
                        .with_failure(reason)
                        .with_fresh_submission_key()
                        .guarded_by(attempt),
                )
                .await
            }
            Verification::Unknown => {
                debug!(request_id = %request_id, "Reconciliation inconclusive");
                Ok(request)
            }
        }
    }

    /// Manually settle an ambiguous, or abandoned, executing request.
    ///
    /// `NotExecuted` keeps the idempotency key, so if the action did land
    /// after all, the next dispatch is deduplicated against it.
    pub async fn resolve(
        &self,
        request_id: &RequestId,
        actor_id: &ActorId,
        resolution: Resolution,
    ) -> ApprovalResult<ApprovalRequest> {
        let request = self.load(request_id).await?;
        let (to, update) = match resolution {
            Resolution::Executed { reference } => {
                if reference.trim().is_empty() {
                    return Err(ApprovalError::Validation(
                        "resolution reference must not be blank".to_string(),
                    ));
                }
                (
                    ApprovalStatus::Executed,
                    StatusUpdate::executed(Utc::now(), reference),
                )
            }
            Resolution::NotExecuted => (
                ApprovalStatus::Approved,
                StatusUpdate::new()
                    .with_failure(format!("resolved as not executed by {actor_id}")),
            ),
        };
        self.ensure_settleable(&request, to)?;

        let update = update.guarded_by(request.execution_attempts);
        let updated = self.transition(&request, to, update).await?;
        info!(
            request_id = %request_id,
            actor_id = %actor_id,
            status = %updated.status,
            "Execution resolved manually"
        );
        Ok(updated)
    }

    /// Dispatch after a confirmation crossed the threshold, retrying
    /// recoverable failures while attempts remain.
    async fn auto_dispatch(&self, request: &ApprovalRequest) {
        if request.execution_attempts >= self.config.max_dispatch_attempts {
            warn!(
                request_id = %request.id,
                attempts = request.execution_attempts,
                "Dispatch attempts exhausted; waiting for explicit dispatch"
            );
            return;
        }

        loop {
            match self.dispatch(&request.id).await {
                Ok(DispatchOutcome::Failed { attempts, reason })
                    if attempts < self.config.max_dispatch_attempts =>
                {
                    debug!(request_id = %request.id, attempts, reason = %reason, "Retrying dispatch");
                    tokio::time::sleep(self.config.receipt_poll_interval).await;
                }
                Ok(outcome) => {
                    debug!(request_id = %request.id, outcome = ?outcome, "Auto dispatch finished");
                    return;
                }
                Err(err) => {
                    warn!(request_id = %request.id, error = %err, "Auto dispatch failed");
                    return;
                }
            }
        }
    }

    /// Executing requests may only be settled from outside the dispatcher
    /// once their outcome is ambiguous or their guard has expired.
    fn ensure_settleable(
        &self,
        request: &ApprovalRequest,
        to: ApprovalStatus,
    ) -> ApprovalResult<()> {
        let from = request.status;
        if from != ApprovalStatus::Executing {
            return Err(ApprovalError::InvalidTransition { from, to });
        }
        if request.is_ambiguous() {
            return Ok(());
        }
        if self.guard_expired(request) {
            warn!(
                request_id = %request.id,
                attempt = request.execution_attempts,
                since = %request.updated_at,
                "Execution guard expired; allowing manual settlement"
            );
            return Ok(());
        }
        debug!(request_id = %request.id, "Execution still in flight");
        Err(ApprovalError::InvalidTransition { from, to })
    }

    fn guard_expired(&self, request: &ApprovalRequest) -> bool {
        Utc::now()
            .signed_duration_since(request.updated_at)
            .to_std()
            .map(|held| held >= self.config.execution_lease)
            .unwrap_or(false)
    }

    async fn apply_execution_result(
        &self,
        guarded: &ApprovalRequest,
        result: ExecutionResult,
    ) -> ApprovalResult<DispatchOutcome> {
        let attempt = guarded.execution_attempts;
        match result {
            Ok(receipt) => {
                let reference = receipt.reference.clone();
                self.transition(
                    guarded,
                    ApprovalStatus::Executed,
                    StatusUpdate::executed(receipt.executed_at, receipt.reference)
                        .with_submission(receipt.submission)
                        .guarded_by(attempt),
                )
                .await?;
                info!(request_id = %guarded.id, reference = %reference, "Request executed");
                Ok(DispatchOutcome::Executed { reference })
            }
            Err(ExecutionFailure::Retryable { reason }) => {
                let updated = self
                    .transition(
                        guarded,
                        ApprovalStatus::Approved,
                        StatusUpdate::new()
                            .with_failure(reason.clone())
                            .guarded_by(attempt),
                    )
                    .await?;
                warn!(
                    request_id = %guarded.id,
                    attempts = updated.execution_attempts,
                    reason = %reason,
                    "Execution failed; request returned to approved"
                );
                Ok(DispatchOutcome::Failed {
                    reason,
                    attempts: updated.execution_attempts,
                })
            }
            Err(ExecutionFailure::Declined { reason, submission }) => {
                let updated = self
                    .transition(
                        guarded,
                        ApprovalStatus::Approved,
                        StatusUpdate::new()
                            .with_failure(reason.clone())
                            .with_submission(submission.clone())
                            .with_fresh_submission_key()
                            .guarded_by(attempt),
                    )
                    .await?;
                warn!(
                    request_id = %guarded.id,
                    attempts = updated.execution_attempts,
                    submission = ?submission,
                    reason = %reason,
                    "Execution declined; request returned to approved under a new idempotency key"
                );
                Ok(DispatchOutcome::Failed {
                    reason,
                    attempts: updated.execution_attempts,
                })
            }
            Err(failure) => {
                let reason = failure.failure_reason();
                let submission = match failure {
                    ExecutionFailure::Ambiguous { submission, .. } => submission,
                    ExecutionFailure::Retryable { .. } | ExecutionFailure::Declined { .. } => None,
                };
                self.transition(
                    guarded,
                    ApprovalStatus::Executing,
                    StatusUpdate::new()
                        .with_failure(reason.clone())
                        .with_submission(submission.clone())
                        .guarded_by(attempt),
                )
                .await?;
                error!(
                    request_id = %guarded.id,
                    submission = ?submission,
                    reason = %reason,
                    "Execution outcome ambiguous; verification required"
                );
                Ok(DispatchOutcome::Ambiguous { reason, submission })
            }
        }
    }

    async fn observed_after_lost_guard(
        &self,
        request_id: &RequestId,
    ) -> ApprovalResult<DispatchOutcome> {
        let current = self.load(request_id).await?;
        match current.status {
            ApprovalStatus::Executed => Ok(DispatchOutcome::AlreadyExecuted {
                reference: current.execution_reference,
            }),
            ApprovalStatus::Executing => Ok(in_flight(&current)),
            status => Err(ApprovalError::NotApproved {
                request_id: request_id.clone(),
                status,
            }),
        }
    }

    /// Move a `Pending`/`Approved` request to the status its active
    /// confirmations call for, until it is stable.
    async fn settle(&self, request_id: &RequestId) -> ApprovalResult<ApprovalRequest> {
        let mut conflicts = 0;
        loop {
            let request = self.load(request_id).await?;
            if !request.status.accepts_decisions() {
                return Ok(request);
            }

            let active = self.storage.active_confirmations(request_id).await?;
            let evaluation = evaluate_request(&request, &active);
            let next = match (request.status, evaluation.outcome) {
                (ApprovalStatus::Pending, ThresholdOutcome::Approved) => ApprovalStatus::Approved,
                (ApprovalStatus::Pending, ThresholdOutcome::Rejected) => ApprovalStatus::Rejected,
                (ApprovalStatus::Approved, ThresholdOutcome::Approved)
                | (ApprovalStatus::Pending, ThresholdOutcome::Insufficient) => {
                    return Ok(request);
                }
                // Approved but below threshold: step back to Pending first
                _ => ApprovalStatus::Pending,
            };

            debug!(
                request_id = %request_id,
                approvals = evaluation.tally.approvals,
                rejections = evaluation.tally.rejections,
                undecided = evaluation.tally.undecided,
                required = request.required_approvals,
                next = %next,
                "Settling request status"
            );

            match self.transition(&request, next, StatusUpdate::new()).await {
                Ok(_) => {}
                Err(err @ ApprovalError::Conflict { .. }) => {
                    conflicts += 1;
                    if conflicts > self.config.max_transition_retries {
                        warn!(request_id = %request_id, conflicts, "Settling gave up after conflicts");
                        return Err(err);
                    }
                    debug!(request_id = %request_id, conflicts, "Status moved underneath; retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Validated compare-and-swap from the request's observed status.
    async fn transition(
        &self,
        observed: &ApprovalRequest,
        to: ApprovalStatus,
        update: StatusUpdate,
    ) -> ApprovalResult<ApprovalRequest> {
        let from = observed.status;
        self.machine.check(from, to)?;
        let now = Utc::now();
        let updated = self
            .storage
            .update_status(&observed.id, from, to, update, now)
            .await?;

        if from != to {
            info!(request_id = %observed.id, from = %from, to = %to, "Status transition");
            self.sink.notify(&StatusTransition::new(
                observed.id.clone(),
                observed.kind(),
                from,
                to,
                now,
            ));
        }
        Ok(updated)
    }

    async fn load(&self, request_id: &RequestId) -> ApprovalResult<ApprovalRequest> {
        self.storage
            .get_request(request_id)
            .await?
            .ok_or_else(|| ApprovalError::NotFound(request_id.clone()))
    }
}

fn in_flight(request: &ApprovalRequest) -> DispatchOutcome {
    match &request.failure_reason {
        Some(reason) => DispatchOutcome::Ambiguous {
            reason: reason.clone(),
            submission: request.submission_reference.clone(),
        },
        None => DispatchOutcome::InProgress,
    }
}
