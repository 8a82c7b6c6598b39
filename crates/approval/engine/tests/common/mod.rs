#![allow(dead_code)]

use approval_adapters::MockLedgerNetwork;
use approval_engine::{
    BroadcastNotificationSink, EngineConfig, ExecutionDispatcher, LedgerNetwork,
    LedgerNetworkRegistry, WorkflowCoordinator,
};
use approval_store::InMemoryApprovalStorage;
use approval_types::{
    ApproverId, LedgerTransaction, NewApprovalRequest, RedemptionSettlement, RequestDomain,
    StatusTransition,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const CHAIN: &str = "testnet";

pub struct Harness {
    pub coordinator: Arc<WorkflowCoordinator>,
    pub storage: Arc<InMemoryApprovalStorage>,
    pub events: broadcast::Receiver<StatusTransition>,
}

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        auto_dispatch: false,
        receipt_poll_interval: Duration::from_millis(5),
        receipt_timeout: Duration::from_millis(100),
        ..EngineConfig::default()
    }
}

pub fn harness(network: Arc<dyn LedgerNetwork>, config: EngineConfig) -> Harness {
    let storage = Arc::new(InMemoryApprovalStorage::new());
    let dispatcher =
        ExecutionDispatcher::with_networks(LedgerNetworkRegistry::new().with(network), &config);
    let sink = BroadcastNotificationSink::new(256);
    let events = sink.subscribe();
    let coordinator =
        WorkflowCoordinator::new(storage.clone(), dispatcher, config).with_sink(Arc::new(sink));
    Harness {
        coordinator: Arc::new(coordinator),
        storage,
        events,
    }
}

pub fn mock_network() -> Arc<MockLedgerNetwork> {
    Arc::new(MockLedgerNetwork::new("mock", &[CHAIN]))
}

pub fn approvers(ids: &[&str]) -> Vec<ApproverId> {
    ids.iter().map(|id| ApproverId::new(*id)).collect()
}

pub fn redemption(required: u32, ids: &[&str]) -> NewApprovalRequest {
    NewApprovalRequest::new(
        RequestDomain::RedemptionSettlement(RedemptionSettlement {
            beneficiary: "investor-42".to_string(),
            amount: 150_000,
            asset_type: "TBILL-26".to_string(),
        }),
        required,
        approvers(ids),
        ApproverId::new("issuer-ops"),
    )
}

pub fn ledger_transfer(required: u32, ids: &[&str]) -> NewApprovalRequest {
    NewApprovalRequest::new(
        RequestDomain::LedgerTransaction(LedgerTransaction {
            destination: "0x8ba1f109551bd432803012645ac136ddd64dba72".to_string(),
            amount: 5_000_000,
            payload: vec![],
            chain_id: CHAIN.to_string(),
        }),
        required,
        approvers(ids),
        ApproverId::new("treasury"),
    )
}

/// Drain transitions published so far.
pub fn drain(events: &mut broadcast::Receiver<StatusTransition>) -> Vec<StatusTransition> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
