use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use steward_types::RunTrigger;

use crate::orchestrator::{Orchestrator, RunError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerResponse {
    Accepted,
    Busy,
}

/// Cheap handle for the HTTP surface to request a manual run.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<oneshot::Sender<TriggerResponse>>,
}

impl SchedulerHandle {
    /// Requests a manual run. Returns `Busy` immediately when a run is in
    /// progress or the scheduler is shutting down.
    pub async fn trigger(&self) -> TriggerResponse {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(reply_tx).await.is_err() {
            return TriggerResponse::Busy;
        }
        reply_rx.await.unwrap_or(TriggerResponse::Busy)
    }
}

/// Single cooperative loop that owns run scheduling: interval ticks,
/// manual triggers, and the shutdown path. Elapsed ticks are dropped while
/// a run is in progress; runs are strictly serialized by the
/// orchestrator's own guard.
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    grace: Duration,
    rx: mpsc::Receiver<oneshot::Sender<TriggerResponse>>,
}

impl Scheduler {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        interval: Duration,
        grace: Duration,
    ) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::channel(8);
        (
            Self {
                orchestrator,
                interval,
                grace,
                rx,
            },
            SchedulerHandle { tx },
        )
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut current: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.orchestrator.is_running() {
                        debug!("interval tick dropped, run in progress");
                    } else {
                        current = Some(self.spawn_run(RunTrigger::Scheduled, &cancel));
                    }
                }
                Some(reply) = self.rx.recv() => {
                    if self.orchestrator.is_running() {
                        let _ = reply.send(TriggerResponse::Busy);
                    } else {
                        current = Some(self.spawn_run(RunTrigger::Manual, &cancel));
                        let _ = reply.send(TriggerResponse::Accepted);
                    }
                }
            }
        }

        // Give the active run its grace period to reach a checkpoint
        // boundary; the cancelled token stops it there.
        if let Some(handle) = current.take() {
            if !handle.is_finished() {
                info!("waiting for the active run to stop");
                match tokio::time::timeout(self.grace, handle).await {
                    Ok(_) => info!("run stopped at a checkpoint boundary"),
                    Err(_) => warn!("grace period elapsed with the run still active"),
                }
            }
        }
    }

    fn spawn_run(&self, trigger: RunTrigger, cancel: &CancellationToken) -> JoinHandle<()> {
        let orchestrator = self.orchestrator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match orchestrator.execute(trigger, &cancel).await {
                Ok(outcome) => {
                    info!(
                        run_id = %outcome.run.run_id,
                        state = outcome.run.state.as_str(),
                        voted = outcome.run.counters.proposals_voted,
                        "run finished"
                    );
                }
                Err(RunError::Busy) => debug!("run request raced an active run"),
                Err(RunError::Cancelled) => info!("run stopped for shutdown"),
                // Fatal run errors are logged by the orchestrator itself.
                Err(_) => {}
            }
        })
    }
}
