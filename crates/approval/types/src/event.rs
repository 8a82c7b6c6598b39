//! Status transition events

use crate::{ApprovalStatus, DomainKind, RequestId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Emitted once per successful status transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub request_id: RequestId,
    pub domain: DomainKind,
    pub from: ApprovalStatus,
    pub to: ApprovalStatus,
    pub timestamp: DateTime<Utc>,
}

impl StatusTransition {
    pub fn new(
        request_id: RequestId,
        domain: DomainKind,
        from: ApprovalStatus,
        to: ApprovalStatus,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id,
            domain,
            from,
            to,
            timestamp,
        }
    }
}

impl std::fmt::Display for StatusTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {} -> {}",
            self.request_id, self.domain, self.from, self.to
        )
    }
}
