mod decision;
mod event;
mod execution;
mod governance;
mod preferences;
mod run;

pub use decision::{AbstainReason, DecisionOutcome, DecisionRecord, RiskLevel, VoteDecision};
pub use event::EngineEvent;
pub use execution::{
    ActivityKind, ActivityRecord, ExecutionPath, ReceiptOutcome, VoteReceipt,
};
pub use governance::{Proposal, ProposalState};
pub use preferences::{PreferencesError, UserPreferences, VotingStrategy};
pub use run::{AgentRun, Checkpoint, RunCounters, RunState, RunTrigger};
