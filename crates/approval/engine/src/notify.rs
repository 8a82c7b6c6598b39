//! Status transition notifications
//!
//! Sinks are synchronous and must not block: the coordinator calls them
//! inline after each successful status write. Delivery to people or systems
//! happens downstream of a sink.

use approval_types::StatusTransition;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Receiver of status transitions. Fire-and-forget.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, transition: &StatusTransition);
}

/// Discards every transition.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullNotificationSink;

impl NotificationSink for NullNotificationSink {
    fn notify(&self, _transition: &StatusTransition) {}
}

/// Logs each transition as a structured `tracing` event.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
    fn notify(&self, transition: &StatusTransition) {
        info!(
            request_id = %transition.request_id,
            domain = %transition.domain,
            from = %transition.from,
            to = %transition.to,
            "Approval status transition"
        );
    }
}

/// Publishes transitions on a tokio broadcast channel.
///
/// Subscribers that fall behind lose the oldest events; publishing never
/// waits for them.
#[derive(Clone)]
pub struct BroadcastNotificationSink {
    sender: broadcast::Sender<StatusTransition>,
}

impl BroadcastNotificationSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusTransition> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastNotificationSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl NotificationSink for BroadcastNotificationSink {
    fn notify(&self, transition: &StatusTransition) {
        // No receivers is fine
        let _ = self.sender.send(transition.clone());
    }
}

/// Forwards every transition to each inner sink in order.
#[derive(Clone, Default)]
pub struct FanoutNotificationSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl NotificationSink for FanoutNotificationSink {
    fn notify(&self, transition: &StatusTransition) {
        for sink in &self.sinks {
            sink.notify(transition);
        }
    }
}
