use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPath {
    Eoa,
    Safe,
    DryRun,
}

impl ExecutionPath {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionPath::Eoa => "eoa",
            ExecutionPath::Safe => "safe",
            ExecutionPath::DryRun => "dry_run",
        }
    }
}

/// Final per-proposal outcome. `Rejected` is a validation refusal from the
/// relay or governor and is never retried; `Error` is a transport failure
/// after the retry budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReceiptOutcome {
    Submitted,
    Rejected { reason: String },
    Skipped { reason: String },
    Error { reason: String },
}

impl ReceiptOutcome {
    pub fn is_submitted(&self) -> bool {
        matches!(self, ReceiptOutcome::Submitted)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ReceiptOutcome::Error { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteReceipt {
    pub proposal_id: String,
    pub path: ExecutionPath,
    pub outcome: ReceiptOutcome,
    /// EOA signature or Safe transaction hash, when a submission happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_ref: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

impl VoteReceipt {
    pub fn skipped(proposal_id: &str, path: ExecutionPath, reason: &str) -> Self {
        Self {
            proposal_id: proposal_id.to_string(),
            path,
            outcome: ReceiptOutcome::Skipped {
                reason: reason.to_string(),
            },
            transport_ref: None,
            submitted_at: Utc::now(),
        }
    }

    /// Whether the receipt references an on-chain transaction.
    pub fn is_onchain(&self) -> bool {
        self.path == ExecutionPath::Safe && self.outcome.is_submitted()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    OpportunityConsidered,
    VoteCast,
    NoOpportunity,
}

/// Audit-trail entry surfaced in the run summary and used by the liveness
/// controller to account for the daily on-chain transaction requirement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub kind: ActivityKind,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
}

impl ActivityRecord {
    pub fn new(kind: ActivityKind) -> Self {
        Self {
            kind,
            at: Utc::now(),
            tx_hash: None,
        }
    }

    pub fn with_tx(kind: ActivityKind, tx_hash: impl Into<String>) -> Self {
        Self {
            kind,
            at: Utc::now(),
            tx_hash: Some(tx_hash.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_submitted_safe_receipts_count_as_onchain() {
        let mut receipt = VoteReceipt {
            proposal_id: "p-1".to_string(),
            path: ExecutionPath::Safe,
            outcome: ReceiptOutcome::Submitted,
            transport_ref: Some("0xhash".to_string()),
            submitted_at: Utc::now(),
        };
        assert!(receipt.is_onchain());

        receipt.path = ExecutionPath::Eoa;
        assert!(!receipt.is_onchain());

        receipt.path = ExecutionPath::Safe;
        receipt.outcome = ReceiptOutcome::Error {
            reason: "timeout".to_string(),
        };
        assert!(!receipt.is_onchain());
    }

    #[test]
    fn outcome_serializes_with_kind_tag() {
        let outcome = ReceiptOutcome::Skipped {
            reason: "dry_run".to_string(),
        };
        let raw = serde_json::to_value(&outcome).expect("serialize");
        assert_eq!(raw["kind"], "skipped");
        assert_eq!(raw["reason"], "dry_run");
    }
}
