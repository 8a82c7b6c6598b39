//! Threshold approval engine.
//!
//! The [`WorkflowCoordinator`] is the single entry point. It records
//! confirmations, asks the [`threshold`] evaluator whether the threshold is
//! met, and drives request status through compare-and-swap writes on the
//! injected store. Once a request is approved, the coordinator takes the
//! `Approved -> Executing` guard and hands the request to the
//! [`ExecutionDispatcher`], which selects an executor by domain.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod confirmations;
pub mod coordinator;
pub mod dispatch;
pub mod network;
pub mod notify;
pub mod state_machine;
pub mod threshold;

pub use config::EngineConfig;
pub use confirmations::{ConfirmInput, ConfirmationLedger};
pub use coordinator::{DispatchOutcome, Resolution, WorkflowCoordinator};
pub use dispatch::{
    ExecutionContext, ExecutionDispatcher, ExecutionReceipt, ExecutionResult, Executor,
    LedgerExecutor, StatusExecutor, Verification,
};
pub use network::{
    ActionSignature, LedgerAction, LedgerNetwork, LedgerNetworkRegistry, LedgerReceipt,
    NetworkError, ReceiptStatus, SubmissionId,
};
pub use notify::{
    BroadcastNotificationSink, FanoutNotificationSink, NotificationSink, NullNotificationSink,
    TracingNotificationSink,
};
pub use state_machine::StateMachine;
pub use threshold::{evaluate, evaluate_request, Tally, ThresholdEvaluation, ThresholdOutcome};
