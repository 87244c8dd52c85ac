use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::preferences::VotingStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

/// Why the agent declined to vote on a proposal it considered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbstainReason {
    BelowThreshold,
    RiskExceedsStrategy,
    UnmappedChoice,
    ProviderError,
}

impl AbstainReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbstainReason::BelowThreshold => "below_threshold",
            AbstainReason::RiskExceedsStrategy => "risk_exceeds_strategy",
            AbstainReason::UnmappedChoice => "unmapped_choice",
            AbstainReason::ProviderError => "provider_error",
        }
    }
}

/// A concrete voting decision for one proposal. Never mutated after
/// creation; the orchestrator appends it to the run's decision log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteDecision {
    pub proposal_id: String,
    /// 1-based index into the proposal's ordered choices.
    pub choice_index: u32,
    pub choice_label: String,
    pub confidence: f64,
    pub reasoning: String,
    pub risk_level: RiskLevel,
    pub strategy: VotingStrategy,
    #[serde(default)]
    pub key_factors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DecisionOutcome {
    Vote(VoteDecision),
    Abstain {
        proposal_id: String,
        reason: AbstainReason,
        /// Model confidence when one was produced before the abstain.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confidence: Option<f64>,
    },
}

impl DecisionOutcome {
    pub fn proposal_id(&self) -> &str {
        match self {
            DecisionOutcome::Vote(decision) => &decision.proposal_id,
            DecisionOutcome::Abstain { proposal_id, .. } => proposal_id,
        }
    }
}

/// One line of the append-only per-run decision log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub run_id: String,
    pub proposal_id: String,
    pub choice_index: Option<u32>,
    pub confidence: Option<f64>,
    pub risk: Option<RiskLevel>,
    pub reasoning: String,
    pub strategy: VotingStrategy,
    pub ts: DateTime<Utc>,
}

impl DecisionRecord {
    pub fn from_outcome(run_id: &str, strategy: VotingStrategy, outcome: &DecisionOutcome) -> Self {
        match outcome {
            DecisionOutcome::Vote(decision) => Self {
                run_id: run_id.to_string(),
                proposal_id: decision.proposal_id.clone(),
                choice_index: Some(decision.choice_index),
                confidence: Some(decision.confidence),
                risk: Some(decision.risk_level),
                reasoning: decision.reasoning.clone(),
                strategy,
                ts: Utc::now(),
            },
            DecisionOutcome::Abstain {
                proposal_id,
                reason,
                confidence,
            } => Self {
                run_id: run_id.to_string(),
                proposal_id: proposal_id.clone(),
                choice_index: None,
                confidence: *confidence,
                risk: None,
                reasoning: format!("abstain: {}", reason.as_str()),
                strategy,
                ts: Utc::now(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abstain_record_has_null_choice() {
        let outcome = DecisionOutcome::Abstain {
            proposal_id: "p-1".to_string(),
            reason: AbstainReason::BelowThreshold,
            confidence: Some(0.64),
        };
        let record = DecisionRecord::from_outcome("r-1", VotingStrategy::Balanced, &outcome);
        assert_eq!(record.choice_index, None);
        assert_eq!(record.confidence, Some(0.64));
        let raw = serde_json::to_value(&record).expect("serialize");
        assert!(raw.get("choice_index").expect("field").is_null());
    }

    #[test]
    fn risk_levels_order_by_severity() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
    }
}
