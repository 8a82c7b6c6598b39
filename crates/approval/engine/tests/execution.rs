mod common;

use approval_adapters::{AlwaysFailNetwork, MockLedgerNetwork, ReceiptMode};
use approval_engine::{
    ConfirmInput, DispatchOutcome, EngineConfig, Resolution, WorkflowCoordinator,
};
use approval_store::{ConfirmationStore, RequestStore, StatusUpdate};
use approval_types::{
    ApprovalError, ApprovalStatus, ApproverId, Confirmation, Decision, Disposition, RequestId,
};
use chrono::Utc;
use common::*;
use std::sync::Arc;
use std::time::Duration;

/// Wait until a dispatcher holds the execution guard and has been invoked.
async fn wait_for_attempt(c: &WorkflowCoordinator, id: &RequestId, attempt: u32) {
    for _ in 0..200 {
        let request = c.get_status(id).await.unwrap();
        if request.status == ApprovalStatus::Executing && request.execution_attempts == attempt {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("dispatch attempt {attempt} never started");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dispatch_submits_exactly_once() {
    let network = Arc::new(
        MockLedgerNetwork::new("mock", &[CHAIN]).with_mode(ReceiptMode::Confirm { pending_polls: 2 }),
    );
    let h = harness(network.clone(), fast_config());
    let c = h.coordinator.clone();
    let id = c.create_request(ledger_transfer(2, &["a", "b", "c"])).await.unwrap();
    c.confirm(&id, ConfirmInput::approve("a").with_proof(vec![0xa1]))
        .await
        .unwrap();
    c.confirm(&id, ConfirmInput::approve("c").with_proof(vec![0xc3]))
        .await
        .unwrap();

    let tasks = (0..8)
        .map(|_| {
            let c = c.clone();
            let id = id.clone();
            tokio::spawn(async move { c.dispatch(&id).await })
        })
        .collect::<Vec<_>>();
    let outcomes = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect::<Vec<_>>();

    let executed = outcomes
        .iter()
        .filter(|o| matches!(o, DispatchOutcome::Executed { .. }))
        .count();
    assert_eq!(executed, 1, "{outcomes:?}");
    assert!(outcomes.iter().all(|o| matches!(
        o,
        DispatchOutcome::Executed { .. }
            | DispatchOutcome::InProgress
            | DispatchOutcome::AlreadyExecuted { .. }
    )));
    assert_eq!(network.submit_calls(), 1);
    assert_eq!(network.applied_actions(), 1);

    let request = c.get_status(&id).await.unwrap();
    assert_eq!(request.status, ApprovalStatus::Executed);
    assert!(request.execution_reference.as_deref().is_some_and(|r| r.starts_with("0x")));
    assert_eq!(
        request.submission_reference,
        network.submission_for(id.as_str()).map(|s| s.0)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_confirmations_execute_once_with_auto_dispatch() {
    let network = mock_network();
    let h = harness(network.clone(), fast_config().with_auto_dispatch(true));
    let c = h.coordinator.clone();
    let id = c
        .create_request(ledger_transfer(3, &["a", "b", "c", "d", "e"]))
        .await
        .unwrap();

    let tasks = ["a", "b", "c", "d", "e"]
        .into_iter()
        .map(|approver| {
            let c = c.clone();
            let id = id.clone();
            tokio::spawn(async move { c.confirm(&id, ConfirmInput::approve(approver)).await })
        })
        .collect::<Vec<_>>();
    for joined in futures::future::join_all(tasks).await {
        // Late confirmations may find the request already executing
        match joined.unwrap() {
            Ok(_) | Err(ApprovalError::RequestNotPending { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    let request = c.get_status(&id).await.unwrap();
    assert_eq!(request.status, ApprovalStatus::Executed);
    assert_eq!(request.execution_attempts, 1);
    assert_eq!(network.applied_actions(), 1);
    assert_eq!(network.submit_calls(), 1);
}

#[tokio::test]
async fn retryable_failure_returns_to_approved_and_stops_at_attempt_limit() {
    let network = Arc::new(AlwaysFailNetwork::new("down", "rpc unreachable"));
    let config = EngineConfig {
        max_dispatch_attempts: 3,
        ..fast_config().with_auto_dispatch(true)
    };
    let h = harness(network, config);
    let c = h.coordinator.clone();
    let id = c.create_request(ledger_transfer(1, &["a"])).await.unwrap();

    let status = c.confirm(&id, ConfirmInput::approve("a")).await.unwrap();
    assert_eq!(status, ApprovalStatus::Approved);

    let request = c.get_status(&id).await.unwrap();
    assert_eq!(request.execution_attempts, 3);
    assert!(request
        .failure_reason
        .as_deref()
        .is_some_and(|r| r.contains("rpc unreachable")));
    assert_eq!(request.disposition(), Disposition::Approved);

    // Explicit dispatch is still allowed after automatic attempts run out
    let outcome = c.dispatch(&id).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Failed { attempts: 4, .. }));
}

#[tokio::test]
async fn declined_action_is_resubmitted_under_a_new_key() {
    let network = Arc::new(MockLedgerNetwork::new("mock", &[CHAIN]).with_mode(ReceiptMode::Fail {
        reason: "execution reverted".to_string(),
    }));
    let h = harness(network.clone(), fast_config());
    let c = h.coordinator.clone();
    let id = c.create_request(ledger_transfer(1, &["a"])).await.unwrap();
    c.confirm(&id, ConfirmInput::approve("a")).await.unwrap();

    let outcome = c.dispatch(&id).await.unwrap();
    match outcome {
        DispatchOutcome::Failed { reason, attempts } => {
            assert!(reason.contains("execution reverted"));
            assert_eq!(attempts, 1);
        }
        other => panic!("expected failure, got {other:?}"),
    }
    let declined = c.get_status(&id).await.unwrap();
    assert_eq!(declined.status, ApprovalStatus::Approved);
    assert_eq!(declined.submission_generation, 1);
    assert_eq!(
        declined.submission_reference,
        network.submission_for(id.as_str()).map(|s| s.0)
    );

    network.set_mode(ReceiptMode::Confirm { pending_polls: 0 });
    let outcome = c.dispatch(&id).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Executed { .. }), "{outcome:?}");
    assert_eq!(network.submit_calls(), 2);
    assert_eq!(network.applied_actions(), 2);

    let executed = c.get_status(&id).await.unwrap();
    assert_eq!(executed.status, ApprovalStatus::Executed);
    assert_eq!(
        executed.submission_reference,
        network.submission_for(&format!("{id}:1")).map(|s| s.0)
    );
}

#[tokio::test]
async fn ambiguous_outcome_pins_executing_until_reconciled() {
    let network =
        Arc::new(MockLedgerNetwork::new("mock", &[CHAIN]).with_mode(ReceiptMode::NeverConfirm));
    let h = harness(network.clone(), fast_config());
    let c = h.coordinator.clone();
    let id = c.create_request(ledger_transfer(1, &["a"])).await.unwrap();
    c.confirm(&id, ConfirmInput::approve("a")).await.unwrap();

    let outcome = c.dispatch(&id).await.unwrap();
    let submission = match outcome {
        DispatchOutcome::Ambiguous { reason, submission } => {
            assert!(reason.starts_with("ambiguous: "));
            submission.expect("submission recorded")
        }
        other => panic!("expected ambiguous, got {other:?}"),
    };

    let request = c.get_status(&id).await.unwrap();
    assert_eq!(request.status, ApprovalStatus::Executing);
    assert_eq!(request.disposition(), Disposition::VerificationRequired);
    assert_eq!(request.submission_reference.as_deref(), Some(submission.as_str()));

    // Never retried automatically, never re-submitted
    assert!(matches!(
        c.dispatch(&id).await.unwrap(),
        DispatchOutcome::Ambiguous { .. }
    ));
    let err = c.confirm(&id, ConfirmInput::reject("a")).await.unwrap_err();
    assert!(matches!(err, ApprovalError::RequestNotPending { .. }));
    assert_eq!(network.submit_calls(), 1);

    // Still pending on the ledger: reconciliation changes nothing
    let unchanged = c.reconcile(&id).await.unwrap();
    assert_eq!(unchanged.status, ApprovalStatus::Executing);

    network.set_mode(ReceiptMode::Confirm { pending_polls: 0 });
    let reconciled = c.reconcile(&id).await.unwrap();
    assert_eq!(reconciled.status, ApprovalStatus::Executed);
    assert!(reconciled.failure_reason.is_none());
    assert!(reconciled.execution_reference.is_some());
    assert_eq!(network.applied_actions(), 1);
}

#[tokio::test]
async fn reconciling_a_failed_submission_returns_to_approved() {
    let network =
        Arc::new(MockLedgerNetwork::new("mock", &[CHAIN]).with_mode(ReceiptMode::NeverConfirm));
    let h = harness(network.clone(), fast_config());
    let c = h.coordinator.clone();
    let id = c.create_request(ledger_transfer(1, &["a"])).await.unwrap();
    c.confirm(&id, ConfirmInput::approve("a")).await.unwrap();
    c.dispatch(&id).await.unwrap();

    network.set_mode(ReceiptMode::Fail {
        reason: "nonce too low".to_string(),
    });
    let request = c.reconcile(&id).await.unwrap();
    assert_eq!(request.status, ApprovalStatus::Approved);
    assert!(request
        .failure_reason
        .as_deref()
        .is_some_and(|r| r.contains("nonce too low")));
    assert_eq!(request.submission_generation, 1);
    assert_eq!(request.idempotency_key(), format!("{id}:1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn in_flight_execution_cannot_be_settled_externally() {
    let network =
        Arc::new(MockLedgerNetwork::new("mock", &[CHAIN]).with_mode(ReceiptMode::NeverConfirm));
    let config = EngineConfig {
        receipt_timeout: Duration::from_millis(400),
        ..fast_config()
    };
    let h = harness(network.clone(), config);
    let c = h.coordinator.clone();
    let id = c.create_request(ledger_transfer(1, &["a"])).await.unwrap();
    c.confirm(&id, ConfirmInput::approve("a")).await.unwrap();

    let running = {
        let c = c.clone();
        let id = id.clone();
        tokio::spawn(async move { c.dispatch(&id).await })
    };
    wait_for_attempt(&c, &id, 1).await;

    let operator = ApproverId::new("ops-lead");
    let err = c
        .resolve(&id, &operator, Resolution::NotExecuted)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ApprovalError::InvalidTransition {
            from: ApprovalStatus::Executing,
            to: ApprovalStatus::Approved,
        }
    ));
    let err = c.reconcile(&id).await.unwrap_err();
    assert!(matches!(
        err,
        ApprovalError::InvalidTransition {
            from: ApprovalStatus::Executing,
            ..
        }
    ));
    assert_eq!(c.dispatch(&id).await.unwrap(), DispatchOutcome::InProgress);

    let outcome = running.await.unwrap().unwrap();
    assert!(matches!(outcome, DispatchOutcome::Ambiguous { .. }), "{outcome:?}");
    assert_eq!(network.submit_calls(), 1);

    // Once the outcome is recorded as ambiguous, an operator may settle it
    let resolved = c
        .resolve(&id, &operator, Resolution::NotExecuted)
        .await
        .unwrap();
    assert_eq!(resolved.status, ApprovalStatus::Approved);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_result_cannot_overwrite_expired_guard_resolution() {
    let network =
        Arc::new(MockLedgerNetwork::new("mock", &[CHAIN]).with_mode(ReceiptMode::NeverConfirm));
    let config = EngineConfig {
        receipt_timeout: Duration::from_millis(300),
        ..fast_config().with_execution_lease(Duration::ZERO)
    };
    let h = harness(network, config);
    let c = h.coordinator.clone();
    let id = c.create_request(ledger_transfer(1, &["a"])).await.unwrap();
    c.confirm(&id, ConfirmInput::approve("a")).await.unwrap();

    let running = {
        let c = c.clone();
        let id = id.clone();
        tokio::spawn(async move { c.dispatch(&id).await })
    };
    wait_for_attempt(&c, &id, 1).await;

    let resolved = c
        .resolve(&id, &ApproverId::new("ops-lead"), Resolution::NotExecuted)
        .await
        .unwrap();
    assert_eq!(resolved.status, ApprovalStatus::Approved);

    let err = running.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        ApprovalError::Conflict {
            found: ApprovalStatus::Approved,
            ..
        }
    ));
    let request = c.get_status(&id).await.unwrap();
    assert_eq!(request.status, ApprovalStatus::Approved);
    assert!(request
        .failure_reason
        .as_deref()
        .is_some_and(|r| r.contains("ops-lead")));
}

#[tokio::test]
async fn abandoned_guard_is_settleable_after_lease() {
    let h = harness(mock_network(), fast_config());
    let c = h.coordinator.clone();
    let id = c.create_request(ledger_transfer(1, &["a"])).await.unwrap();
    c.confirm(&id, ConfirmInput::approve("a")).await.unwrap();

    // A dispatcher that took the guard and never came back
    h.storage
        .update_status(
            &id,
            ApprovalStatus::Approved,
            ApprovalStatus::Executing,
            StatusUpdate::new().with_attempt(),
            Utc::now(),
        )
        .await
        .unwrap();
    let operator = ApproverId::new("ops-lead");
    let err = c
        .resolve(&id, &operator, Resolution::NotExecuted)
        .await
        .unwrap_err();
    assert!(matches!(err, ApprovalError::InvalidTransition { .. }));

    h.storage
        .update_status(
            &id,
            ApprovalStatus::Executing,
            ApprovalStatus::Executing,
            StatusUpdate::new(),
            Utc::now() - chrono::Duration::minutes(11),
        )
        .await
        .unwrap();
    let resolved = c
        .resolve(&id, &operator, Resolution::NotExecuted)
        .await
        .unwrap();
    assert_eq!(resolved.status, ApprovalStatus::Approved);
}

#[tokio::test]
async fn released_guard_does_not_consume_an_attempt() {
    let network = mock_network();
    let h = harness(network.clone(), fast_config());
    let c = h.coordinator.clone();
    let id = c.create_request(ledger_transfer(1, &["a"])).await.unwrap();
    c.confirm(&id, ConfirmInput::approve("a")).await.unwrap();
    assert_eq!(c.get_status(&id).await.unwrap().status, ApprovalStatus::Approved);

    // A reversal written straight to the store, not yet settled
    h.storage
        .record_confirmation(Confirmation::new(
            id.clone(),
            ApproverId::new("a"),
            Decision::Reject,
            Utc::now(),
        ))
        .await
        .unwrap();

    let outcome = c.dispatch(&id).await.unwrap();
    assert_eq!(
        outcome,
        DispatchOutcome::Released {
            status: ApprovalStatus::Rejected
        }
    );
    let request = c.get_status(&id).await.unwrap();
    assert_eq!(request.execution_attempts, 0);
    assert_eq!(network.submit_calls(), 0);
}

#[tokio::test]
async fn unreachable_ledger_during_reconcile_is_an_error() {
    let network =
        Arc::new(MockLedgerNetwork::new("mock", &[CHAIN]).with_mode(ReceiptMode::NeverConfirm));
    let h = harness(network.clone(), fast_config());
    let c = h.coordinator.clone();
    let id = c.create_request(ledger_transfer(1, &["a"])).await.unwrap();
    c.confirm(&id, ConfirmInput::approve("a")).await.unwrap();
    c.dispatch(&id).await.unwrap();

    network.set_mode(ReceiptMode::Unreachable);
    let err = c.reconcile(&id).await.unwrap_err();
    assert!(matches!(err, ApprovalError::Execution(_)));
    assert_eq!(c.get_status(&id).await.unwrap().status, ApprovalStatus::Executing);
}

#[tokio::test]
async fn manual_resolution_and_idempotent_resubmission() {
    let network =
        Arc::new(MockLedgerNetwork::new("mock", &[CHAIN]).with_mode(ReceiptMode::NeverConfirm));
    let h = harness(network.clone(), fast_config());
    let c = h.coordinator.clone();
    let id = c.create_request(ledger_transfer(1, &["a"])).await.unwrap();
    c.confirm(&id, ConfirmInput::approve("a")).await.unwrap();
    c.dispatch(&id).await.unwrap();

    let operator = ApproverId::new("ops-lead");
    let request = c
        .resolve(&id, &operator, Resolution::NotExecuted)
        .await
        .unwrap();
    assert_eq!(request.status, ApprovalStatus::Approved);

    // A manual resolution keeps the idempotency key, so dispatching again
    // cannot apply the transfer twice
    network.set_mode(ReceiptMode::Confirm { pending_polls: 0 });
    let outcome = c.dispatch(&id).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Executed { .. }));
    assert_eq!(network.submit_calls(), 2);
    assert_eq!(network.applied_actions(), 1);

    let err = c
        .resolve(
            &id,
            &operator,
            Resolution::Executed {
                reference: "0xmanual".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ApprovalError::InvalidTransition {
            from: ApprovalStatus::Executed,
            ..
        }
    ));
}

#[tokio::test]
async fn manual_resolution_as_executed_records_reference() {
    let network =
        Arc::new(MockLedgerNetwork::new("mock", &[CHAIN]).with_mode(ReceiptMode::NeverConfirm));
    let h = harness(network, fast_config());
    let c = h.coordinator.clone();
    let id = c.create_request(ledger_transfer(1, &["a"])).await.unwrap();
    c.confirm(&id, ConfirmInput::approve("a")).await.unwrap();
    c.dispatch(&id).await.unwrap();

    let request = c
        .resolve(
            &id,
            &ApproverId::new("ops-lead"),
            Resolution::Executed {
                reference: "0xfound-on-explorer".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(request.status, ApprovalStatus::Executed);
    assert_eq!(
        request.execution_reference.as_deref(),
        Some("0xfound-on-explorer")
    );
    assert!(request.failure_reason.is_none());
}

#[tokio::test]
async fn unregistered_chain_fails_without_submitting() {
    let network = Arc::new(MockLedgerNetwork::new("mock", &["other-chain"]));
    let h = harness(network.clone(), fast_config());
    let c = h.coordinator.clone();
    let id = c.create_request(ledger_transfer(1, &["a"])).await.unwrap();
    c.confirm(&id, ConfirmInput::approve("a")).await.unwrap();

    let outcome = c.dispatch(&id).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Failed { .. }));
    assert_eq!(network.submit_calls(), 0);
}

#[tokio::test]
async fn receipt_timeout_respects_configured_depth() {
    let network = Arc::new(
        MockLedgerNetwork::new("mock", &[CHAIN]).with_mode(ReceiptMode::Confirm { pending_polls: 0 }),
    );
    let config = EngineConfig {
        required_ledger_confirmations: 3,
        receipt_poll_interval: Duration::from_millis(2),
        receipt_timeout: Duration::from_secs(5),
        ..fast_config()
    };
    let h = harness(network, config);
    let c = h.coordinator.clone();
    let id = c.create_request(ledger_transfer(1, &["a"])).await.unwrap();
    c.confirm(&id, ConfirmInput::approve("a")).await.unwrap();

    let outcome = c.dispatch(&id).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Executed { .. }));
}
