//! Threshold evaluation
//!
//! A pure function over one snapshot of a request's active confirmations.
//! It never reads or writes storage; the coordinator decides what to do with
//! the outcome.

use approval_types::{ApprovalRequest, ApproverId, Confirmation};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// What the active confirmations say about a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdOutcome {
    /// Not enough approvals yet, but still reachable
    Insufficient,
    /// Enough approvals
    Approved,
    /// Threshold can no longer be reached
    Rejected,
}

/// Vote counts behind an outcome.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub approvals: u32,
    pub rejections: u32,
    /// Designated approvers with no active decision
    pub undecided: u32,
    /// Confirmations from non-designated approvers, skipped
    pub ignored: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdEvaluation {
    pub outcome: ThresholdOutcome,
    pub tally: Tally,
}

/// Evaluate a threshold against active confirmations.
///
/// Only designated approvers count and each counts once; if the snapshot
/// holds more than one active decision for the same approver, the newest
/// wins.
pub fn evaluate(
    required_approvals: u32,
    designated_approvers: &BTreeSet<ApproverId>,
    active_confirmations: &[Confirmation],
) -> ThresholdEvaluation {
    let mut latest: BTreeMap<&ApproverId, &Confirmation> = BTreeMap::new();
    let mut ignored = 0u32;

    for confirmation in active_confirmations {
        if !designated_approvers.contains(&confirmation.approver_id) {
            ignored = ignored.saturating_add(1);
            continue;
        }
        match latest.get(&confirmation.approver_id) {
            Some(existing) if existing.timestamp > confirmation.timestamp => {}
            _ => {
                latest.insert(&confirmation.approver_id, confirmation);
            }
        }
    }

    let approvals = saturating_u32(latest.values().filter(|c| c.is_approval()).count());
    let rejections = saturating_u32(latest.len()).saturating_sub(approvals);
    let designated = saturating_u32(designated_approvers.len());
    let undecided = designated.saturating_sub(approvals.saturating_add(rejections));

    let outcome = if approvals >= required_approvals {
        ThresholdOutcome::Approved
    } else if approvals.saturating_add(undecided) < required_approvals {
        ThresholdOutcome::Rejected
    } else {
        ThresholdOutcome::Insufficient
    };

    ThresholdEvaluation {
        outcome,
        tally: Tally {
            approvals,
            rejections,
            undecided,
            ignored,
        },
    }
}

/// [`evaluate`] using the request's own threshold and approver set.
pub fn evaluate_request(
    request: &ApprovalRequest,
    active_confirmations: &[Confirmation],
) -> ThresholdEvaluation {
    evaluate(
        request.required_approvals,
        &request.designated_approvers,
        active_confirmations,
    )
}

fn saturating_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
