//! Approval requests, their domain payloads, and lifecycle status

use crate::{ApprovalError, ApprovalResult, ApproverId, RequestId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Lifecycle status of an approval request.
///
/// `Executed`, `Rejected` and `Revoked` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Collecting confirmations
    #[default]
    Pending,
    /// Threshold reached, waiting for dispatch
    Approved,
    /// Execution guard held; the side effect is in flight
    Executing,
    /// Side effect completed
    Executed,
    /// Threshold became unreachable
    Rejected,
    /// Withdrawn by the originator
    Revoked,
}

impl ApprovalStatus {
    pub const ALL: [ApprovalStatus; 6] = [
        Self::Pending,
        Self::Approved,
        Self::Executing,
        Self::Executed,
        Self::Rejected,
        Self::Revoked,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Executing => "executing",
            Self::Executed => "executed",
            Self::Rejected => "rejected",
            Self::Revoked => "revoked",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Executed | Self::Rejected | Self::Revoked)
    }

    /// Whether approvers may still record or change decisions.
    pub fn accepts_decisions(self) -> bool {
        matches!(self, Self::Pending | Self::Approved)
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = ApprovalError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| ApprovalError::Validation(format!("unknown status '{value}'")))
    }
}

/// Discriminant of [`RequestDomain`], used for queries and dispatcher selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainKind {
    LedgerTransaction,
    RedemptionSettlement,
}

impl DomainKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LedgerTransaction => "ledger_transaction",
            Self::RedemptionSettlement => "redemption_settlement",
        }
    }
}

impl std::fmt::Display for DomainKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DomainKind {
    type Err = ApprovalError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ledger_transaction" => Ok(Self::LedgerTransaction),
            "redemption_settlement" => Ok(Self::RedemptionSettlement),
            other => Err(ApprovalError::Validation(format!(
                "unknown domain '{other}'; expected ledger_transaction or redemption_settlement"
            ))),
        }
    }
}

/// A prepared transaction for an external ledger (multi-signature wallet action).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    /// Destination address on the target chain
    pub destination: String,
    /// Value transferred, in the chain's smallest unit
    #[serde(with = "amount_string")]
    pub amount: u128,
    /// Opaque call data
    #[serde(default)]
    pub payload: Vec<u8>,
    /// Chain the transaction targets
    pub chain_id: String,
}

/// Settlement of an approved redemption request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionSettlement {
    pub beneficiary: String,
    #[serde(with = "amount_string")]
    pub amount: u128,
    pub asset_type: String,
}

/// What an approval request will do once approved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestDomain {
    LedgerTransaction(LedgerTransaction),
    RedemptionSettlement(RedemptionSettlement),
}

impl RequestDomain {
    pub fn kind(&self) -> DomainKind {
        match self {
            Self::LedgerTransaction(_) => DomainKind::LedgerTransaction,
            Self::RedemptionSettlement(_) => DomainKind::RedemptionSettlement,
        }
    }

    /// Check that the payload carries every field its executor needs.
    pub fn validate(&self) -> ApprovalResult<()> {
        match self {
            Self::LedgerTransaction(tx) => {
                require_text("destination", &tx.destination)?;
                require_text("chain_id", &tx.chain_id)?;
                if tx.amount == 0 && tx.payload.is_empty() {
                    return Err(ApprovalError::Validation(
                        "ledger transaction must move value or carry call data".to_string(),
                    ));
                }
                Ok(())
            }
            Self::RedemptionSettlement(settlement) => {
                require_text("beneficiary", &settlement.beneficiary)?;
                require_text("asset_type", &settlement.asset_type)?;
                if settlement.amount == 0 {
                    return Err(ApprovalError::Validation(
                        "redemption amount must be positive".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Caller input for creating an approval request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewApprovalRequest {
    pub domain: RequestDomain,
    pub required_approvals: u32,
    pub approvers: Vec<ApproverId>,
    pub created_by: ApproverId,
}

impl NewApprovalRequest {
    pub fn new(
        domain: RequestDomain,
        required_approvals: u32,
        approvers: impl IntoIterator<Item = ApproverId>,
        created_by: ApproverId,
    ) -> Self {
        Self {
            domain,
            required_approvals,
            approvers: approvers.into_iter().collect(),
            created_by,
        }
    }

    /// Reject malformed input before anything is persisted.
    pub fn validate(&self) -> ApprovalResult<()> {
        if self.required_approvals < 1 {
            return Err(ApprovalError::Validation(
                "required_approvals must be at least 1".to_string(),
            ));
        }
        if self.approvers.is_empty() {
            return Err(ApprovalError::Validation(
                "designated approver set must not be empty".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        for approver in &self.approvers {
            require_text("approver id", approver.as_str())?;
            if !seen.insert(approver) {
                return Err(ApprovalError::Validation(format!(
                    "approver '{approver}' is listed more than once"
                )));
            }
        }
        require_text("created_by", self.created_by.as_str())?;
        self.domain.validate()
    }
}

/// A request for threshold approval.
///
/// `required_approvals` and `designated_approvers` are fixed at creation;
/// no API changes them afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: RequestId,
    pub domain: RequestDomain,
    pub required_approvals: u32,
    pub designated_approvers: BTreeSet<ApproverId>,
    pub created_by: ApproverId,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    /// External receipt or settlement reference
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_reference: Option<String>,
    /// Ledger submission handle, kept for reconciliation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submission_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Number of times the dispatcher was invoked
    #[serde(default)]
    pub execution_attempts: u32,
    /// Bumped each time the external system definitively declines an
    /// action, so the next submission is not deduplicated against it
    #[serde(default)]
    pub submission_generation: u32,
}

impl ApprovalRequest {
    /// Build a fresh `Pending` request. Callers must have validated `new`.
    pub fn from_new(new: NewApprovalRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: RequestId::generate(),
            domain: new.domain,
            required_approvals: new.required_approvals,
            designated_approvers: new.approvers.into_iter().collect(),
            created_by: new.created_by,
            status: ApprovalStatus::Pending,
            created_at: now,
            updated_at: now,
            executed_at: None,
            execution_reference: None,
            submission_reference: None,
            failure_reason: None,
            execution_attempts: 0,
            submission_generation: 0,
        }
    }

    pub fn kind(&self) -> DomainKind {
        self.domain.kind()
    }

    pub fn is_designated(&self, approver: &ApproverId) -> bool {
        self.designated_approvers.contains(approver)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// An execution whose outcome is unknown and needs reconciliation.
    pub fn is_ambiguous(&self) -> bool {
        self.status == ApprovalStatus::Executing && self.failure_reason.is_some()
    }

    /// Key external systems deduplicate submissions on.
    ///
    /// Stable across retries of the same action; changes only after the
    /// external system declined the previous one.
    pub fn idempotency_key(&self) -> String {
        match self.submission_generation {
            0 => self.id.to_string(),
            generation => format!("{}:{generation}", self.id),
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self.status {
            ApprovalStatus::Pending => Disposition::Pending,
            ApprovalStatus::Approved => Disposition::Approved,
            ApprovalStatus::Executing if self.is_ambiguous() => Disposition::VerificationRequired,
            ApprovalStatus::Executing => Disposition::Executing,
            ApprovalStatus::Executed => Disposition::Executed,
            ApprovalStatus::Rejected => Disposition::Rejected,
            ApprovalStatus::Revoked => Disposition::Revoked,
        }
    }
}

/// User-facing view of a request's state.
///
/// Identical to [`ApprovalStatus`] except that an ambiguous execution is
/// reported as `VerificationRequired` rather than as a generic failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Pending,
    Approved,
    Executing,
    VerificationRequired,
    Executed,
    Rejected,
    Revoked,
}

fn require_text(field: &str, value: &str) -> ApprovalResult<()> {
    if value.trim().is_empty() {
        return Err(ApprovalError::Validation(format!("{field} must not be blank")));
    }
    Ok(())
}

/// Amounts travel as decimal strings; token quantities overflow JSON numbers.
mod amount_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => text.trim().parse::<u128>().map_err(de::Error::custom),
            Raw::Number(number) => Ok(u128::from(number)),
        }
    }
}
