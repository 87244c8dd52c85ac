use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use steward_decision::DecisionError;
use steward_observability::{emit_event, ObservabilityEvent, ProcessKind};
use steward_state::{DecisionLog, LoadOptions, SaveOptions, StateError, StateStore};
use steward_types::{
    ActivityKind, ActivityRecord, AgentRun, Checkpoint, DecisionOutcome, DecisionRecord,
    EngineEvent, ExecutionPath, ReceiptOutcome, RunState, RunTrigger, VoteReceipt,
};
use steward_voting::VoteError;

use crate::activity::{ActivityController, LivenessOutcome};
use crate::event_bus::EventBus;
use crate::filter::filter_proposals;
use crate::health::HealthState;
use crate::ports::{DecisionMaker, ProposalSource, VoteCaster};
use crate::preferences::load_preferences;

pub const CHECKPOINT_PREFIX: &str = "agent_checkpoint_";
const ACTIVE_RUN_STATE: &str = "agent_active_run";
const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub spaces: Vec<String>,
    pub execution_path: ExecutionPath,
    pub fetch_limit: usize,
    pub fetch_attempts: u32,
    pub fetch_backoff: Duration,
    pub checkpoint_retention_runs: usize,
    pub decision_log_retention_runs: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            spaces: Vec::new(),
            execution_path: ExecutionPath::DryRun,
            fetch_limit: 20,
            fetch_attempts: 3,
            fetch_backoff: Duration::from_secs(2),
            checkpoint_retention_runs: 100,
            decision_log_retention_runs: 100,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("another run is already in progress")]
    Busy,
    #[error("preferences unavailable: {0}")]
    Preferences(String),
    #[error("proposal fetch failed after retries: {0}")]
    Fetch(String),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("run cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run: AgentRun,
    pub receipts: Vec<VoteReceipt>,
    pub warning: Option<String>,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The run state machine. Owns the live `AgentRun` exclusively, threads
/// the collaborators per proposal, and checkpoints every transition so a
/// killed process resumes the same run without re-submitting anything
/// that already has a final receipt.
pub struct Orchestrator {
    state: Arc<StateStore>,
    decision_log: Arc<DecisionLog>,
    proposals: Arc<dyn ProposalSource>,
    decider: Arc<dyn DecisionMaker>,
    caster: Arc<dyn VoteCaster>,
    activity: ActivityController,
    events: EventBus,
    health: HealthState,
    settings: OrchestratorSettings,
    running: AtomicBool,
    last_run: tokio::sync::RwLock<Option<AgentRun>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<StateStore>,
        decision_log: Arc<DecisionLog>,
        proposals: Arc<dyn ProposalSource>,
        decider: Arc<dyn DecisionMaker>,
        caster: Arc<dyn VoteCaster>,
        activity: ActivityController,
        events: EventBus,
        health: HealthState,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            state,
            decision_log,
            proposals,
            decider,
            caster,
            activity,
            events,
            health,
            settings,
            running: AtomicBool::new(false),
            last_run: tokio::sync::RwLock::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> &HealthState {
        &self.health
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn state_store(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub fn decision_log(&self) -> &Arc<DecisionLog> {
        &self.decision_log
    }

    pub async fn last_run(&self) -> Option<AgentRun> {
        self.last_run.read().await.clone()
    }

    /// Executes (or resumes) one agent run. Exactly one run may be in
    /// progress per process; concurrent callers get `Busy` immediately.
    pub async fn execute(
        &self,
        trigger: RunTrigger,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, RunError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(RunError::Busy);
        }
        let _guard = RunningGuard(&self.running);
        self.execute_inner(trigger, cancel).await
    }

    async fn execute_inner(
        &self,
        trigger: RunTrigger,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, RunError> {
        let dry_run = self.settings.execution_path == ExecutionPath::DryRun;

        let (mut run, mut checkpoint, resumed) = match self.load_resumable_checkpoint().await {
            Some(cp) => {
                info!(run_id = %cp.run_id, state = cp.state.as_str(), "resuming interrupted run");
                let run = AgentRun {
                    run_id: cp.run_id.clone(),
                    trigger: cp.trigger,
                    started_at: cp.started_at,
                    finished_at: None,
                    state: cp.state,
                    counters: cp.counters,
                    spaces: cp.spaces.clone(),
                    dry_run: cp.dry_run,
                    activity: Vec::new(),
                };
                (run, cp, true)
            }
            None => {
                let run = AgentRun::new(trigger, self.settings.spaces.clone(), dry_run);
                let checkpoint = Checkpoint::for_run(&run);
                (run, checkpoint, false)
            }
        };

        if !resumed {
            self.save_active_pointer(&run.run_id).await?;
        }

        match self.drive(&mut run, &mut checkpoint, resumed, cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(RunError::Cancelled) => {
                self.stop_run(&mut run, &mut checkpoint).await;
                Err(RunError::Cancelled)
            }
            Err(err) => {
                self.fail_run(&mut run, &mut checkpoint, &err).await;
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        run: &mut AgentRun,
        checkpoint: &mut Checkpoint,
        resumed: bool,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, RunError> {
        let path = self.settings.execution_path;

        self.transition(run, checkpoint, RunState::Starting).await?;
        let prefs = load_preferences(&self.state).await?;
        self.ensure_not_cancelled(cancel)?;

        self.transition(run, checkpoint, RunState::FetchingProposals)
            .await?;
        let proposals = self.fetch_with_retries(cancel).await?;

        self.transition(run, checkpoint, RunState::Filtering).await?;
        let now = Utc::now().timestamp();
        let candidates = filter_proposals(&proposals, &prefs, now);
        run.counters.proposals_seen = candidates.len() as u32;

        // A cursor without a receipt means the process died with a
        // submission in flight. The signature may have reached the relay,
        // so that proposal is never re-signed in this run.
        if resumed {
            if let Some(cursor) = checkpoint.cursor.clone() {
                if !checkpoint.has_receipt(&cursor) {
                    warn!(run_id = %run.run_id, proposal_id = %cursor, "in-flight submission at crash, recording as unknown");
                    let receipt = VoteReceipt {
                        proposal_id: cursor.clone(),
                        path,
                        outcome: ReceiptOutcome::Error {
                            reason: "unknown_pre_receipt".to_string(),
                        },
                        transport_ref: None,
                        submitted_at: Utc::now(),
                    };
                    run.counters.errors += 1;
                    self.record_receipt(run, checkpoint, receipt).await?;
                }
            }
        }

        for proposal in &candidates {
            self.ensure_not_cancelled(cancel)?;
            if checkpoint.has_receipt(&proposal.id) {
                continue;
            }

            self.transition(run, checkpoint, RunState::AnalyzingProposal)
                .await?;
            run.activity
                .push(ActivityRecord::new(ActivityKind::OpportunityConsidered));

            let outcome = match self
                .decider
                .decide(
                    proposal,
                    prefs.voting_strategy,
                    prefs.confidence_threshold,
                    cancel,
                )
                .await
            {
                Ok(outcome) => outcome,
                Err(DecisionError::Cancelled) => return Err(RunError::Cancelled),
            };

            let record = DecisionRecord::from_outcome(&run.run_id, prefs.voting_strategy, &outcome);
            if let Err(err) = self.decision_log.append(&record).await {
                warn!(run_id = %run.run_id, error = %err, "decision log append failed");
            }

            match outcome {
                DecisionOutcome::Abstain { reason, .. } => {
                    let receipt = VoteReceipt::skipped(&proposal.id, path, reason.as_str());
                    self.record_receipt(run, checkpoint, receipt).await?;
                }
                DecisionOutcome::Vote(decision) => {
                    checkpoint.cursor = Some(proposal.id.clone());
                    self.transition(run, checkpoint, RunState::SubmittingVote)
                        .await?;
                    let receipt = match self
                        .caster
                        .cast(&decision, &proposal.space, path, cancel)
                        .await
                    {
                        Ok(receipt) => receipt,
                        Err(VoteError::Cancelled) => return Err(RunError::Cancelled),
                        Err(err) => VoteReceipt {
                            proposal_id: proposal.id.clone(),
                            path,
                            outcome: ReceiptOutcome::Error {
                                reason: err.to_string(),
                            },
                            transport_ref: None,
                            submitted_at: Utc::now(),
                        },
                    };

                    if receipt.outcome.is_submitted() {
                        run.counters.proposals_voted += 1;
                        let record = match receipt.transport_ref.as_ref() {
                            Some(tx) if receipt.is_onchain() => {
                                ActivityRecord::with_tx(ActivityKind::VoteCast, tx.clone())
                            }
                            _ => ActivityRecord::new(ActivityKind::VoteCast),
                        };
                        run.activity.push(record);
                    }
                    if receipt.outcome.is_error() {
                        run.counters.errors += 1;
                    }
                    self.record_receipt(run, checkpoint, receipt).await?;
                }
            }
        }

        self.transition(run, checkpoint, RunState::Finalizing).await?;

        let onchain_tx = checkpoint
            .receipts
            .values()
            .find(|receipt| receipt.is_onchain())
            .and_then(|receipt| receipt.transport_ref.clone());

        let liveness = if run.dry_run {
            None
        } else {
            Some(
                self.activity
                    .ensure_daily_compliance(Utc::now().date_naive(), onchain_tx.as_deref())
                    .await,
            )
        };

        match &liveness {
            Some(LivenessOutcome::SubmittedSelfTransfer(tx_hash)) => {
                run.activity
                    .push(ActivityRecord::with_tx(ActivityKind::NoOpportunity, tx_hash.clone()));
            }
            _ => {
                if candidates.is_empty() {
                    run.activity
                        .push(ActivityRecord::new(ActivityKind::NoOpportunity));
                }
            }
        }

        let mut warnings = Vec::new();
        if let Some(LivenessOutcome::Unavailable(reason)) = &liveness {
            warnings.push(format!("liveness transaction unavailable: {reason}"));
        }
        if run.counters.errors > 0 {
            warnings.push(format!("{} proposal(s) errored", run.counters.errors));
        }
        let warning = if warnings.is_empty() {
            None
        } else {
            Some(warnings.join("; "))
        };

        let terminal = if warning.is_some() {
            RunState::CompletedWithWarning
        } else {
            RunState::Completed
        };
        run.finished_at = Some(Utc::now());
        self.transition(run, checkpoint, terminal).await?;
        self.clear_active_pointer().await;
        self.prune_artifacts().await;

        let receipts = ordered_receipts(checkpoint);
        self.events.publish(EngineEvent::new(
            "run.finished",
            json!({
                "run_id": run.run_id,
                "state": run.state,
                "counters": run.counters,
                "warning": warning,
            }),
        ));
        let outcome = RunOutcome {
            run: run.clone(),
            receipts,
            warning,
        };
        *self.last_run.write().await = Some(run.clone());
        Ok(outcome)
    }

    fn ensure_not_cancelled(&self, cancel: &CancellationToken) -> Result<(), RunError> {
        if cancel.is_cancelled() {
            Err(RunError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn fetch_with_retries(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<steward_types::Proposal>, RunError> {
        let mut attempt = 0u32;
        loop {
            let fetch = self
                .proposals
                .active_proposals(&self.settings.spaces, self.settings.fetch_limit);
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RunError::Cancelled),
                result = fetch => result,
            };
            match result {
                Ok(proposals) => return Ok(proposals),
                Err(err) if err.is_retryable() && attempt + 1 < self.settings.fetch_attempts => {
                    attempt += 1;
                    let delay = self.settings.fetch_backoff.saturating_mul(attempt);
                    warn!(attempt, error = %err, "proposal fetch retry");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(RunError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(RunError::Fetch(err.to_string())),
            }
        }
    }

    async fn transition(
        &self,
        run: &mut AgentRun,
        checkpoint: &mut Checkpoint,
        state: RunState,
    ) -> Result<(), RunError> {
        run.state = state;
        checkpoint.state = state;
        checkpoint.counters = run.counters;
        checkpoint.updated_at = Utc::now();
        info!(
            run_id = %run.run_id,
            state = state.as_str(),
            proposals_seen = run.counters.proposals_seen,
            proposals_voted = run.counters.proposals_voted,
            errors = run.counters.errors,
            "run state transition"
        );
        emit_event(
            tracing::Level::INFO,
            ProcessKind::Agent,
            ObservabilityEvent {
                event: "run.state.transition",
                component: "core.orchestrator",
                run_id: Some(&run.run_id),
                proposal_id: None,
                space: None,
                state: Some(state.as_str()),
                status: None,
                error_code: None,
                detail: None,
            },
        );
        self.health.record_transition(state).await;
        self.events.publish(EngineEvent::new(
            "run.state",
            json!({
                "run_id": run.run_id,
                "state": state,
                "counters": run.counters,
            }),
        ));
        *self.last_run.write().await = Some(run.clone());
        self.write_checkpoint(checkpoint).await
    }

    async fn record_receipt(
        &self,
        run: &mut AgentRun,
        checkpoint: &mut Checkpoint,
        receipt: VoteReceipt,
    ) -> Result<(), RunError> {
        self.events.publish(EngineEvent::new(
            "run.receipt",
            json!({
                "run_id": run.run_id,
                "proposal_id": receipt.proposal_id,
                "outcome": receipt.outcome,
            }),
        ));
        checkpoint.cursor = Some(receipt.proposal_id.clone());
        checkpoint
            .receipts
            .insert(receipt.proposal_id.clone(), receipt);
        checkpoint.counters = run.counters;
        checkpoint.updated_at = Utc::now();
        self.write_checkpoint(checkpoint).await
    }

    /// Checkpoint writes get one retry; a state backend that fails twice
    /// in a row is a fatal condition for the run.
    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RunError> {
        let name = format!("{CHECKPOINT_PREFIX}{}", checkpoint.run_id);
        let payload = serde_json::to_value(checkpoint).map_err(StateError::from)?;
        let options = SaveOptions {
            version: CHECKPOINT_VERSION,
            ..Default::default()
        };
        if let Err(first) = self.state.save(&name, &payload, options.clone()).await {
            warn!(run_id = %checkpoint.run_id, error = %first, "checkpoint write failed, retrying");
            self.state.save(&name, &payload, options).await?;
        }
        Ok(())
    }

    async fn load_resumable_checkpoint(&self) -> Option<Checkpoint> {
        let pointer = self
            .state
            .load(ACTIVE_RUN_STATE, LoadOptions::default())
            .await
            .ok()
            .flatten()?;
        let run_id = pointer.get("run_id").and_then(|v| v.as_str())?.to_string();
        let name = format!("{CHECKPOINT_PREFIX}{run_id}");
        let raw = match self
            .state
            .load(
                &name,
                LoadOptions {
                    allow_recovery: true,
                    ..Default::default()
                },
            )
            .await
        {
            Ok(Some(raw)) => raw,
            _ => {
                self.clear_active_pointer().await;
                return None;
            }
        };
        let checkpoint: Checkpoint = match serde_json::from_value(raw) {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                warn!(run_id, error = %err, "unreadable checkpoint, starting fresh");
                self.clear_active_pointer().await;
                return None;
            }
        };
        if checkpoint.state.is_terminal() {
            // Nothing to resume; the pointer outlived the finished run.
            self.clear_active_pointer().await;
            return None;
        }
        Some(checkpoint)
    }

    async fn save_active_pointer(&self, run_id: &str) -> Result<(), RunError> {
        self.state
            .save(
                ACTIVE_RUN_STATE,
                &json!({ "run_id": run_id }),
                SaveOptions::default(),
            )
            .await?;
        Ok(())
    }

    async fn clear_active_pointer(&self) {
        if let Err(err) = self.state.delete(ACTIVE_RUN_STATE).await {
            warn!(error = %err, "active run pointer cleanup failed");
        }
    }

    async fn stop_run(&self, run: &mut AgentRun, checkpoint: &mut Checkpoint) {
        info!(run_id = %run.run_id, "stopping at checkpoint boundary");
        run.state = RunState::Stopping;
        checkpoint.state = RunState::Stopping;
        checkpoint.updated_at = Utc::now();
        self.health.record_transition(RunState::Stopping).await;
        if let Err(err) = self.write_checkpoint(checkpoint).await {
            error!(run_id = %run.run_id, error = %err, "final stopping checkpoint failed");
        }
        self.events.publish(EngineEvent::new(
            "run.state",
            json!({ "run_id": run.run_id, "state": RunState::Stopping }),
        ));
        *self.last_run.write().await = Some(run.clone());
    }

    async fn fail_run(&self, run: &mut AgentRun, checkpoint: &mut Checkpoint, cause: &RunError) {
        error!(run_id = %run.run_id, kind = error_kind(cause), error = %cause, "run failed");
        let detail = cause.to_string();
        emit_event(
            tracing::Level::ERROR,
            ProcessKind::Agent,
            ObservabilityEvent {
                event: "run.failed",
                component: "core.orchestrator",
                run_id: Some(&run.run_id),
                proposal_id: None,
                space: None,
                state: Some(RunState::Failed.as_str()),
                status: Some("failed"),
                error_code: Some(error_kind(cause)),
                detail: Some(&detail),
            },
        );
        run.state = RunState::Failed;
        run.finished_at = Some(Utc::now());
        checkpoint.state = RunState::Failed;
        checkpoint.updated_at = Utc::now();
        self.health.record_transition(RunState::Failed).await;
        if let Err(err) = self.write_checkpoint(checkpoint).await {
            error!(run_id = %run.run_id, error = %err, "failed-state checkpoint write failed");
        }
        self.clear_active_pointer().await;
        self.events.publish(EngineEvent::new(
            "run.finished",
            json!({
                "run_id": run.run_id,
                "state": RunState::Failed,
                "error": cause.to_string(),
            }),
        ));
        *self.last_run.write().await = Some(run.clone());
    }

    /// Terminal-run housekeeping: old checkpoints and decision logs are
    /// pruned to the configured retention.
    async fn prune_artifacts(&self) {
        if let Err(err) = self
            .decision_log
            .prune(self.settings.decision_log_retention_runs)
            .await
        {
            warn!(error = %err, "decision log pruning failed");
        }
        if let Err(err) = self
            .prune_checkpoints(self.settings.checkpoint_retention_runs)
            .await
        {
            warn!(error = %err, "checkpoint pruning failed");
        }
    }

    async fn prune_checkpoints(&self, keep: usize) -> Result<(), StateError> {
        let mut found = Vec::new();
        let mut entries = fs::read_dir(self.state.root()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with(CHECKPOINT_PREFIX) || !name.ends_with(".json") {
                continue;
            }
            let modified = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            found.push((modified, path));
        }
        found.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, stale) in found.into_iter().skip(keep) {
            let _ = fs::remove_file(&stale).await;
        }
        Ok(())
    }
}

/// Receipts in deterministic order: by proposal id, which is also the
/// checkpoint map order.
fn ordered_receipts(checkpoint: &Checkpoint) -> Vec<VoteReceipt> {
    checkpoint.receipts.values().cloned().collect()
}

fn error_kind(err: &RunError) -> &'static str {
    match err {
        RunError::Busy => "busy",
        RunError::Preferences(_) => "preferences",
        RunError::Fetch(_) => "fetch",
        RunError::State(_) => "state",
        RunError::Cancelled => "cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use steward_snapshot::SnapshotError;
    use steward_types::{
        AbstainReason, Proposal, ProposalState, RiskLevel, UserPreferences, VoteDecision,
        VotingStrategy,
    };

    use crate::ports::LivenessSubmitter;
    use crate::preferences::save_preferences;

    const AUTHOR: &str = "0x00000000000000000000000000000000000000aa";
    const DENIED: &str = "0x000000000000000000000000000000000000dead";

    fn proposal(id: &str, author: &str, end_offset: i64) -> Proposal {
        Proposal {
            id: id.to_string(),
            space: "dao.eth".to_string(),
            title: format!("Proposal {id}"),
            body: "body".to_string(),
            author: author.to_string(),
            start: 0,
            end: Utc::now().timestamp() + end_offset,
            state: ProposalState::Active,
            choices: vec!["For".to_string(), "Against".to_string()],
            scores: vec![],
            scores_total: 0.0,
        }
    }

    struct FakeSource {
        proposals: Vec<Proposal>,
        fail: bool,
        calls: Mutex<u32>,
    }

    impl FakeSource {
        fn with(proposals: Vec<Proposal>) -> Arc<Self> {
            Arc::new(Self {
                proposals,
                fail: false,
                calls: Mutex::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                proposals: Vec::new(),
                fail: true,
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().expect("calls")
        }
    }

    #[async_trait]
    impl ProposalSource for FakeSource {
        async fn active_proposals(
            &self,
            _spaces: &[String],
            _first: usize,
        ) -> Result<Vec<Proposal>, SnapshotError> {
            *self.calls.lock().expect("calls") += 1;
            if self.fail {
                return Err(SnapshotError::Transport("hub unreachable".to_string()));
            }
            Ok(self.proposals.clone())
        }
    }

    struct FakeDecider {
        /// proposal id -> confidence; ids absent here abstain.
        votes: HashMap<String, f64>,
        delay: Duration,
    }

    impl FakeDecider {
        fn voting(ids: &[(&str, f64)]) -> Arc<Self> {
            Arc::new(Self {
                votes: ids
                    .iter()
                    .map(|(id, c)| (id.to_string(), *c))
                    .collect(),
                delay: Duration::ZERO,
            })
        }

        fn slow(ids: &[(&str, f64)], delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                votes: ids
                    .iter()
                    .map(|(id, c)| (id.to_string(), *c))
                    .collect(),
                delay,
            })
        }
    }

    #[async_trait]
    impl DecisionMaker for FakeDecider {
        async fn decide(
            &self,
            proposal: &Proposal,
            strategy: VotingStrategy,
            confidence_threshold: f64,
            _cancel: &CancellationToken,
        ) -> Result<DecisionOutcome, DecisionError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match self.votes.get(&proposal.id) {
                Some(confidence) if *confidence >= confidence_threshold => {
                    Ok(DecisionOutcome::Vote(VoteDecision {
                        proposal_id: proposal.id.clone(),
                        choice_index: 1,
                        choice_label: proposal.choices[0].clone(),
                        confidence: *confidence,
                        reasoning: "looks sound".to_string(),
                        risk_level: RiskLevel::Low,
                        strategy,
                        key_factors: vec![],
                    }))
                }
                Some(confidence) => Ok(DecisionOutcome::Abstain {
                    proposal_id: proposal.id.clone(),
                    reason: AbstainReason::BelowThreshold,
                    confidence: Some(*confidence),
                }),
                None => Ok(DecisionOutcome::Abstain {
                    proposal_id: proposal.id.clone(),
                    reason: AbstainReason::ProviderError,
                    confidence: None,
                }),
            }
        }
    }

    struct FakeCaster {
        /// proposal ids that should come back as transport errors.
        failing: Vec<String>,
        onchain: bool,
        casts: Mutex<Vec<String>>,
    }

    impl FakeCaster {
        fn submitting() -> Arc<Self> {
            Arc::new(Self {
                failing: Vec::new(),
                onchain: false,
                casts: Mutex::new(Vec::new()),
            })
        }

        fn onchain() -> Arc<Self> {
            Arc::new(Self {
                failing: Vec::new(),
                onchain: true,
                casts: Mutex::new(Vec::new()),
            })
        }

        fn failing_for(ids: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                failing: ids.iter().map(|s| s.to_string()).collect(),
                onchain: false,
                casts: Mutex::new(Vec::new()),
            })
        }

        fn casts(&self) -> Vec<String> {
            self.casts.lock().expect("casts").clone()
        }
    }

    #[async_trait]
    impl VoteCaster for FakeCaster {
        async fn cast(
            &self,
            decision: &VoteDecision,
            _space: &str,
            path: ExecutionPath,
            _cancel: &CancellationToken,
        ) -> Result<VoteReceipt, VoteError> {
            self.casts
                .lock()
                .expect("casts")
                .push(decision.proposal_id.clone());
            if path == ExecutionPath::DryRun {
                return Ok(VoteReceipt::skipped(
                    &decision.proposal_id,
                    path,
                    "dry_run",
                ));
            }
            if self.failing.contains(&decision.proposal_id) {
                return Ok(VoteReceipt {
                    proposal_id: decision.proposal_id.clone(),
                    path,
                    outcome: ReceiptOutcome::Error {
                        reason: "relay timeout".to_string(),
                    },
                    transport_ref: None,
                    submitted_at: Utc::now(),
                });
            }
            let (path, transport) = if self.onchain {
                (ExecutionPath::Safe, format!("0xsafe-{}", decision.proposal_id))
            } else {
                (ExecutionPath::Eoa, format!("0xsig-{}", decision.proposal_id))
            };
            Ok(VoteReceipt {
                proposal_id: decision.proposal_id.clone(),
                path,
                outcome: ReceiptOutcome::Submitted,
                transport_ref: Some(transport),
                submitted_at: Utc::now(),
            })
        }
    }

    struct FakeLiveness {
        calls: Mutex<u32>,
    }

    impl FakeLiveness {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().expect("calls")
        }
    }

    #[async_trait]
    impl LivenessSubmitter for FakeLiveness {
        async fn submit_liveness_tx(&self) -> Result<String, VoteError> {
            *self.calls.lock().expect("calls") += 1;
            Ok("0xlive".to_string())
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        state: Arc<StateStore>,
        orchestrator: Arc<Orchestrator>,
    }

    async fn harness(
        source: Arc<FakeSource>,
        decider: Arc<FakeDecider>,
        caster: Arc<FakeCaster>,
        liveness: Option<Arc<dyn LivenessSubmitter>>,
        path: ExecutionPath,
    ) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = Arc::new(StateStore::new(dir.path()).await.expect("store"));
        let decision_log = Arc::new(DecisionLog::new(dir.path()).await.expect("log"));
        let activity = ActivityController::new(state.clone(), liveness);
        let settings = OrchestratorSettings {
            spaces: vec!["dao.eth".to_string()],
            execution_path: path,
            fetch_attempts: 2,
            fetch_backoff: Duration::ZERO,
            ..Default::default()
        };
        let orchestrator = Arc::new(Orchestrator::new(
            state.clone(),
            decision_log,
            source,
            decider,
            caster,
            activity,
            EventBus::new(),
            HealthState::new(),
            settings,
        ));
        Harness {
            _dir: dir,
            state,
            orchestrator,
        }
    }

    #[tokio::test]
    async fn happy_path_votes_in_deadline_order_and_completes() {
        let source = FakeSource::with(vec![
            proposal("p1", AUTHOR, 3600),
            proposal("p2", AUTHOR, 7200),
            proposal("p3", AUTHOR, 1800),
        ]);
        // p3 falls below the 0.7 default threshold.
        let decider = FakeDecider::voting(&[("p1", 0.82), ("p2", 0.91), ("p3", 0.64)]);
        let caster = FakeCaster::submitting();
        let h = harness(source, decider, caster.clone(), None, ExecutionPath::Eoa).await;

        let outcome = h
            .orchestrator
            .execute(RunTrigger::Scheduled, &CancellationToken::new())
            .await
            .expect("run");

        // Closest-to-close first; the abstaining p3 is analyzed first but
        // only p1 and p2 reach the executor.
        assert_eq!(caster.casts(), vec!["p1".to_string(), "p2".to_string()]);
        assert_eq!(outcome.run.counters.proposals_seen, 3);
        assert_eq!(outcome.run.counters.proposals_voted, 2);
        assert_eq!(outcome.run.counters.errors, 0);
        assert_eq!(outcome.receipts.len(), 3);
        // EOA submissions are off-chain, so liveness cannot be satisfied
        // and the run carries a warning instead of failing.
        assert!(matches!(
            outcome.run.state,
            RunState::Completed | RunState::CompletedWithWarning
        ));

        let log = h.orchestrator.decision_log().read(&outcome.run.run_id).await.expect("log");
        assert_eq!(log.len(), 3);
        assert_eq!(log.iter().filter(|r| r.choice_index.is_none()).count(), 1);
    }

    #[tokio::test]
    async fn subscribers_receive_run_events_from_the_bus() {
        let source = FakeSource::with(vec![proposal("p1", AUTHOR, 1000)]);
        let decider = FakeDecider::voting(&[("p1", 0.9)]);
        let caster = FakeCaster::submitting();
        let h = harness(source, decider, caster, None, ExecutionPath::Eoa).await;

        let mut rx = h.orchestrator.events().subscribe();
        let outcome = h
            .orchestrator
            .execute(RunTrigger::Scheduled, &CancellationToken::new())
            .await
            .expect("run");

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(
                event.properties.get("run_id").and_then(|v| v.as_str()),
                Some(outcome.run.run_id.as_str())
            );
            kinds.push(event.kind);
        }
        assert!(kinds.iter().any(|k| k == "run.state"));
        assert!(kinds.iter().any(|k| k == "run.receipt"));
        assert_eq!(kinds.last().map(String::as_str), Some("run.finished"));
    }

    #[tokio::test]
    async fn denied_authors_are_never_analyzed() {
        let source = FakeSource::with(vec![
            proposal("p1", DENIED, 1000),
            proposal("p2", AUTHOR, 2000),
        ]);
        let decider = FakeDecider::voting(&[("p1", 0.9), ("p2", 0.9)]);
        let caster = FakeCaster::submitting();
        let h = harness(source, decider, caster.clone(), None, ExecutionPath::Eoa).await;

        let mut prefs = UserPreferences::default();
        prefs.deny_list = vec![DENIED.to_string()];
        save_preferences(&h.state, &prefs).await.expect("prefs");

        let outcome = h
            .orchestrator
            .execute(RunTrigger::Scheduled, &CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(caster.casts(), vec!["p2".to_string()]);
        assert_eq!(outcome.run.counters.proposals_seen, 1);
    }

    #[tokio::test]
    async fn dry_run_skips_every_submission_and_liveness() {
        let source = FakeSource::with(vec![proposal("p1", AUTHOR, 1000)]);
        let decider = FakeDecider::voting(&[("p1", 0.9)]);
        let caster = FakeCaster::submitting();
        let liveness = FakeLiveness::new();
        let h = harness(
            source,
            decider,
            caster.clone(),
            Some(liveness.clone()),
            ExecutionPath::DryRun,
        )
        .await;

        let outcome = h
            .orchestrator
            .execute(RunTrigger::Manual, &CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(outcome.run.state, RunState::Completed);
        assert!(outcome
            .receipts
            .iter()
            .all(|r| matches!(&r.outcome, ReceiptOutcome::Skipped { reason } if reason == "dry_run")));
        assert_eq!(liveness.calls(), 0);

        // The decision still lands in the audit log.
        let log = h.orchestrator.decision_log().read(&outcome.run.run_id).await.expect("log");
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn empty_run_submits_the_liveness_self_transfer() {
        let source = FakeSource::with(vec![]);
        let decider = FakeDecider::voting(&[]);
        let caster = FakeCaster::submitting();
        let liveness = FakeLiveness::new();
        let h = harness(
            source,
            decider,
            caster,
            Some(liveness.clone()),
            ExecutionPath::Safe,
        )
        .await;

        let outcome = h
            .orchestrator
            .execute(RunTrigger::Scheduled, &CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(outcome.run.state, RunState::Completed);
        assert_eq!(liveness.calls(), 1);

        let no_opportunity = outcome
            .run
            .activity
            .iter()
            .find(|r| r.kind == ActivityKind::NoOpportunity)
            .expect("no-opportunity record");
        assert_eq!(no_opportunity.tx_hash.as_deref(), Some("0xlive"));

        // The tracker now covers today; a second empty run needs nothing.
        let outcome = h
            .orchestrator
            .execute(RunTrigger::Scheduled, &CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(liveness.calls(), 1);
        assert_eq!(outcome.run.state, RunState::Completed);
    }

    #[tokio::test]
    async fn onchain_vote_satisfies_liveness_without_self_transfer() {
        let source = FakeSource::with(vec![proposal("p1", AUTHOR, 1000)]);
        let decider = FakeDecider::voting(&[("p1", 0.9)]);
        let caster = FakeCaster::onchain();
        let liveness = FakeLiveness::new();
        let h = harness(
            source,
            decider,
            caster,
            Some(liveness.clone()),
            ExecutionPath::Safe,
        )
        .await;

        let outcome = h
            .orchestrator
            .execute(RunTrigger::Scheduled, &CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(outcome.run.state, RunState::Completed);
        assert_eq!(liveness.calls(), 0);
        assert!(outcome
            .run
            .activity
            .iter()
            .any(|r| r.kind == ActivityKind::VoteCast && r.tx_hash.is_some()));
    }

    #[tokio::test]
    async fn proposal_errors_warn_but_do_not_abort_the_run() {
        let source = FakeSource::with(vec![
            proposal("p1", AUTHOR, 1000),
            proposal("p2", AUTHOR, 2000),
        ]);
        let decider = FakeDecider::voting(&[("p1", 0.9), ("p2", 0.9)]);
        let caster = FakeCaster::failing_for(&["p1"]);
        let h = harness(source, decider, caster.clone(), None, ExecutionPath::Eoa).await;

        let outcome = h
            .orchestrator
            .execute(RunTrigger::Scheduled, &CancellationToken::new())
            .await
            .expect("run");
        // Both proposals were attempted despite the first one's error.
        assert_eq!(caster.casts().len(), 2);
        assert_eq!(outcome.run.counters.errors, 1);
        assert_eq!(outcome.run.counters.proposals_voted, 1);
        assert_eq!(outcome.run.state, RunState::CompletedWithWarning);
    }

    #[tokio::test]
    async fn fetch_failure_after_retries_fails_the_run() {
        let source = FakeSource::failing();
        let decider = FakeDecider::voting(&[]);
        let caster = FakeCaster::submitting();
        let h = harness(source.clone(), decider, caster, None, ExecutionPath::Eoa).await;

        let err = h
            .orchestrator
            .execute(RunTrigger::Scheduled, &CancellationToken::new())
            .await
            .expect_err("fetch is down");
        assert!(matches!(err, RunError::Fetch(_)));
        assert_eq!(source.calls(), 2);
        let last = h.orchestrator.last_run().await.expect("last run");
        assert_eq!(last.state, RunState::Failed);

        // A failed run leaves no resumable pointer behind.
        assert!(h.orchestrator.load_resumable_checkpoint().await.is_none());
    }

    #[tokio::test]
    async fn concurrent_triggers_observe_busy() {
        let source = FakeSource::with(vec![proposal("p1", AUTHOR, 1000)]);
        let decider = FakeDecider::slow(&[("p1", 0.9)], Duration::from_millis(300));
        let caster = FakeCaster::submitting();
        let h = harness(source, decider, caster, None, ExecutionPath::Eoa).await;

        let orchestrator = h.orchestrator.clone();
        let first = tokio::spawn(async move {
            orchestrator
                .execute(RunTrigger::Scheduled, &CancellationToken::new())
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = h
            .orchestrator
            .execute(RunTrigger::Manual, &CancellationToken::new())
            .await;
        assert!(matches!(second, Err(RunError::Busy)));
        assert!(first.await.expect("join").is_ok());
    }

    #[tokio::test]
    async fn crash_mid_submission_resumes_without_resigning() {
        let source = FakeSource::with(vec![
            proposal("p1", AUTHOR, 1000),
            proposal("p2", AUTHOR, 2000),
            proposal("p3", AUTHOR, 3000),
        ]);
        let decider = FakeDecider::voting(&[("p1", 0.9), ("p2", 0.9), ("p3", 0.9)]);
        let caster = FakeCaster::submitting();
        let h = harness(source, decider, caster.clone(), None, ExecutionPath::Eoa).await;

        // Hand-build the state a crash during p2's submission leaves
        // behind: p1 has a final receipt, p2 is the cursor with none.
        let run = AgentRun::new(RunTrigger::Scheduled, vec!["dao.eth".to_string()], false);
        let mut checkpoint = Checkpoint::for_run(&run);
        checkpoint.state = RunState::SubmittingVote;
        checkpoint.cursor = Some("p2".to_string());
        checkpoint.receipts.insert(
            "p1".to_string(),
            VoteReceipt {
                proposal_id: "p1".to_string(),
                path: ExecutionPath::Eoa,
                outcome: ReceiptOutcome::Submitted,
                transport_ref: Some("0xsig-p1".to_string()),
                submitted_at: Utc::now(),
            },
        );
        checkpoint.counters.proposals_voted = 1;
        let name = format!("{CHECKPOINT_PREFIX}{}", run.run_id);
        h.state
            .save(
                &name,
                &serde_json::to_value(&checkpoint).expect("serialize"),
                SaveOptions::default(),
            )
            .await
            .expect("checkpoint");
        h.state
            .save(
                ACTIVE_RUN_STATE,
                &json!({ "run_id": run.run_id }),
                SaveOptions::default(),
            )
            .await
            .expect("pointer");

        let outcome = h
            .orchestrator
            .execute(RunTrigger::Scheduled, &CancellationToken::new())
            .await
            .expect("resumed run");

        // Same run id, p2 never re-signed, p3 processed normally.
        assert_eq!(outcome.run.run_id, run.run_id);
        assert_eq!(caster.casts(), vec!["p3".to_string()]);
        let p2 = outcome
            .receipts
            .iter()
            .find(|r| r.proposal_id == "p2")
            .expect("p2 receipt");
        assert_eq!(
            p2.outcome,
            ReceiptOutcome::Error {
                reason: "unknown_pre_receipt".to_string()
            }
        );
        assert_eq!(outcome.run.state, RunState::CompletedWithWarning);
    }

    #[tokio::test]
    async fn completed_runs_are_not_resumed() {
        let source = FakeSource::with(vec![proposal("p1", AUTHOR, 1000)]);
        let decider = FakeDecider::voting(&[("p1", 0.9)]);
        let caster = FakeCaster::submitting();
        let h = harness(source, decider, caster, None, ExecutionPath::Eoa).await;

        let first = h
            .orchestrator
            .execute(RunTrigger::Scheduled, &CancellationToken::new())
            .await
            .expect("first run");
        let second = h
            .orchestrator
            .execute(RunTrigger::Scheduled, &CancellationToken::new())
            .await
            .expect("second run");
        assert_ne!(first.run.run_id, second.run.run_id);
    }

    #[tokio::test]
    async fn cancellation_writes_a_stopping_checkpoint_and_resumes_later() {
        let source = FakeSource::with(vec![
            proposal("p1", AUTHOR, 1000),
            proposal("p2", AUTHOR, 2000),
        ]);
        let decider = FakeDecider::slow(&[("p1", 0.9), ("p2", 0.9)], Duration::from_millis(100));
        let caster = FakeCaster::submitting();
        let h = harness(source, decider, caster.clone(), None, ExecutionPath::Eoa).await;

        let cancel = CancellationToken::new();
        let orchestrator = h.orchestrator.clone();
        let cancel_clone = cancel.clone();
        let task = tokio::spawn(async move {
            orchestrator
                .execute(RunTrigger::Scheduled, &cancel_clone)
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let result = task.await.expect("join");
        assert!(matches!(result, Err(RunError::Cancelled)));

        let pending = h
            .orchestrator
            .load_resumable_checkpoint()
            .await
            .expect("stopping checkpoint survives");
        assert!(!pending.state.is_terminal());
        let interrupted_run_id = pending.run_id.clone();

        // The next run resumes the same run id and finishes it.
        let outcome = h
            .orchestrator
            .execute(RunTrigger::Scheduled, &CancellationToken::new())
            .await
            .expect("resume");
        assert_eq!(outcome.run.run_id, interrupted_run_id);
        assert!(outcome.run.state.is_terminal());
    }
}
