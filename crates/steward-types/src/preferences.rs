use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VotingStrategy {
    Conservative,
    Balanced,
    Aggressive,
}

impl VotingStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            VotingStrategy::Conservative => "conservative",
            VotingStrategy::Balanced => "balanced",
            VotingStrategy::Aggressive => "aggressive",
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PreferencesError {
    #[error("confidence_threshold must be within [0, 1], got {0}")]
    ThresholdOutOfRange(f64),
    #[error("max_proposals_per_run must be within [1, 10], got {0}")]
    CapOutOfRange(u32),
    #[error("address `{0}` appears in both allow_list and deny_list")]
    ListOverlap(String),
    #[error("invalid address `{0}` in {1}")]
    InvalidAddress(String, &'static str),
}

/// Operator-owned voting policy. Loaded at run start, validated both at
/// save time and after load so a hand-edited file cannot smuggle in an
/// out-of-bounds value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPreferences {
    pub voting_strategy: VotingStrategy,
    pub confidence_threshold: f64,
    pub max_proposals_per_run: u32,
    #[serde(default)]
    pub allow_list: Vec<String>,
    #[serde(default)]
    pub deny_list: Vec<String>,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            voting_strategy: VotingStrategy::Balanced,
            confidence_threshold: 0.7,
            max_proposals_per_run: 3,
            allow_list: Vec::new(),
            deny_list: Vec::new(),
        }
    }
}

impl UserPreferences {
    pub fn validate(&self) -> Result<(), PreferencesError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold)
            || !self.confidence_threshold.is_finite()
        {
            return Err(PreferencesError::ThresholdOutOfRange(
                self.confidence_threshold,
            ));
        }
        if !(1..=10).contains(&self.max_proposals_per_run) {
            return Err(PreferencesError::CapOutOfRange(self.max_proposals_per_run));
        }
        for (list, label) in [
            (&self.allow_list, "allow_list"),
            (&self.deny_list, "deny_list"),
        ] {
            for address in list {
                if !looks_like_address(address) {
                    return Err(PreferencesError::InvalidAddress(address.clone(), label));
                }
            }
        }
        let deny = self
            .deny_list
            .iter()
            .map(|a| a.to_ascii_lowercase())
            .collect::<BTreeSet<_>>();
        if let Some(overlap) = self
            .allow_list
            .iter()
            .find(|a| deny.contains(&a.to_ascii_lowercase()))
        {
            return Err(PreferencesError::ListOverlap(overlap.clone()));
        }
        Ok(())
    }

    pub fn denies(&self, author: &str) -> bool {
        self.deny_list
            .iter()
            .any(|a| a.eq_ignore_ascii_case(author))
    }

    pub fn allows(&self, author: &str) -> bool {
        self.allow_list
            .iter()
            .any(|a| a.eq_ignore_ascii_case(author))
    }
}

fn looks_like_address(raw: &str) -> bool {
    let Some(hex) = raw.strip_prefix("0x") else {
        return false;
    };
    hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit())
}
