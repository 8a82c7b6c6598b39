use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Dispatch as soon as a confirmation pushes a request over its threshold.
    pub auto_dispatch: bool,
    /// Automatic dispatches stop once a request has taken the execution guard
    /// this many times. Explicit `dispatch` calls are not limited.
    pub max_dispatch_attempts: u32,
    /// Compare-and-swap retries before a `Conflict` is surfaced.
    pub max_transition_retries: u32,
    pub receipt_poll_interval: Duration,
    /// How long to wait for a ledger receipt before the outcome is ambiguous.
    pub receipt_timeout: Duration,
    pub required_ledger_confirmations: u64,
    /// How long an execution guard without a recorded outcome is trusted.
    /// Past it, the request can be reconciled or resolved manually, which
    /// recovers requests whose dispatcher crashed. Keep it above
    /// `receipt_timeout`.
    pub execution_lease: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            auto_dispatch: true,
            max_dispatch_attempts: 3,
            max_transition_retries: 8,
            receipt_poll_interval: Duration::from_millis(500),
            receipt_timeout: Duration::from_secs(60),
            required_ledger_confirmations: 1,
            execution_lease: Duration::from_secs(600),
        }
    }
}

impl EngineConfig {
    pub fn with_auto_dispatch(mut self, enabled: bool) -> Self {
        self.auto_dispatch = enabled;
        self
    }

    pub fn with_execution_lease(mut self, lease: Duration) -> Self {
        self.execution_lease = lease;
        self
    }

    pub fn with_receipt_timing(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.receipt_poll_interval = poll_interval;
        self.receipt_timeout = timeout;
        self
    }
}
