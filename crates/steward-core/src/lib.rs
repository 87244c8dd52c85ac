mod activity;
mod config;
mod event_bus;
mod filter;
mod health;
mod orchestrator;
mod ports;
mod preferences;
mod scheduler;

pub use activity::{ActivityController, ActivityTracker, LivenessOutcome, ACTIVITY_STATE};
pub use config::{AgentConfig, ConfigError, RetentionSettings};
pub use event_bus::EventBus;
pub use filter::filter_proposals;
pub use health::{HealthSnapshot, HealthState};
pub use orchestrator::{
    Orchestrator, OrchestratorSettings, RunError, RunOutcome, CHECKPOINT_PREFIX,
};
pub use ports::{DecisionMaker, LivenessSubmitter, ProposalSource, SafeLiveness, VoteCaster};
pub use preferences::{load_preferences, save_preferences, PREFERENCES_STATE};
pub use scheduler::{Scheduler, SchedulerHandle, TriggerResponse};
