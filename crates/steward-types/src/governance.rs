use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalState {
    Active,
    Closed,
    Pending,
}

/// A governance proposal as returned by the hub. Proposals are fetched per
/// run and never persisted long-term; the struct is read-only for the
/// duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub space: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub author: String,
    /// Voting window open, unix seconds.
    pub start: i64,
    /// Voting window close, unix seconds.
    pub end: i64,
    pub state: ProposalState,
    /// Ordered choice labels; votes reference these 1-based.
    pub choices: Vec<String>,
    /// Per-choice cast vote weight, aligned with `choices`.
    #[serde(default)]
    pub scores: Vec<f64>,
    #[serde(default)]
    pub scores_total: f64,
}

impl Proposal {
    pub fn is_open_at(&self, now: i64) -> bool {
        self.state == ProposalState::Active && self.end > now
    }

    pub fn seconds_to_close(&self, now: i64) -> i64 {
        self.end - now
    }
}
