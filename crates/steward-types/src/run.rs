use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::execution::{ActivityRecord, VoteReceipt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Idle,
    Starting,
    FetchingProposals,
    Filtering,
    AnalyzingProposal,
    SubmittingVote,
    Finalizing,
    Completed,
    CompletedWithWarning,
    Failed,
    Stopping,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::CompletedWithWarning | RunState::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Idle => "IDLE",
            RunState::Starting => "STARTING",
            RunState::FetchingProposals => "FETCHING_PROPOSALS",
            RunState::Filtering => "FILTERING",
            RunState::AnalyzingProposal => "ANALYZING_PROPOSAL",
            RunState::SubmittingVote => "SUBMITTING_VOTE",
            RunState::Finalizing => "FINALIZING",
            RunState::Completed => "COMPLETED",
            RunState::CompletedWithWarning => "COMPLETED_WITH_WARNING",
            RunState::Failed => "FAILED",
            RunState::Stopping => "STOPPING",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub proposals_seen: u32,
    pub proposals_voted: u32,
    pub errors: u32,
}

/// The live run owned exclusively by the orchestrator. Other components
/// receive it read-only; exactly one run may be in progress per process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub run_id: String,
    pub trigger: RunTrigger,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub state: RunState,
    pub counters: RunCounters,
    pub spaces: Vec<String>,
    pub dry_run: bool,
    #[serde(default)]
    pub activity: Vec<ActivityRecord>,
}

impl AgentRun {
    pub fn new(trigger: RunTrigger, spaces: Vec<String>, dry_run: bool) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            trigger,
            started_at: Utc::now(),
            finished_at: None,
            state: RunState::Starting,
            counters: RunCounters::default(),
            spaces,
            dry_run,
            activity: Vec::new(),
        }
    }
}

/// Persisted orchestrator progress, sufficient to resume a killed process
/// without re-submitting proposals that already have a final receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    pub trigger: RunTrigger,
    pub state: RunState,
    pub spaces: Vec<String>,
    pub dry_run: bool,
    /// Last proposal id handed to the executor, receipt or not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    /// Final receipts keyed by proposal id, in a deterministic order.
    #[serde(default)]
    pub receipts: BTreeMap<String, VoteReceipt>,
    pub counters: RunCounters,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn for_run(run: &AgentRun) -> Self {
        Self {
            run_id: run.run_id.clone(),
            trigger: run.trigger,
            state: run.state,
            spaces: run.spaces.clone(),
            dry_run: run.dry_run,
            cursor: None,
            receipts: BTreeMap::new(),
            counters: run.counters,
            started_at: run.started_at,
            updated_at: Utc::now(),
        }
    }

    pub fn has_receipt(&self, proposal_id: &str) -> bool {
        self.receipts.contains_key(proposal_id)
    }
}
