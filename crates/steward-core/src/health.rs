use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use steward_types::RunState;

/// Transitions inside this window count toward the fast-transition flag.
const FAST_WINDOW: Duration = Duration::from_secs(5);
const FAST_TRANSITION_COUNT: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub seconds_since_last_transition: i64,
    pub is_transitioning_fast: bool,
    pub agent_state: String,
    pub timestamp: i64,
}

struct HealthInner {
    state: RunState,
    last_transition: DateTime<Utc>,
    recent: VecDeque<DateTime<Utc>>,
}

/// Shared view of orchestrator liveness consumed by the supervisor-facing
/// healthcheck. `healthy` goes false only on a failed run or when no
/// transition has happened inside the staleness window.
#[derive(Clone)]
pub struct HealthState {
    inner: Arc<RwLock<HealthInner>>,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HealthInner {
                state: RunState::Idle,
                last_transition: Utc::now(),
                recent: VecDeque::new(),
            })),
        }
    }

    pub async fn record_transition(&self, state: RunState) {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        inner.state = state;
        inner.last_transition = now;
        inner.recent.push_back(now);
        let window = chrono::Duration::from_std(FAST_WINDOW).unwrap_or(chrono::Duration::zero());
        while let Some(front) = inner.recent.front() {
            if now - *front > window {
                inner.recent.pop_front();
            } else {
                break;
            }
        }
    }

    pub async fn snapshot(&self, staleness: Duration) -> HealthSnapshot {
        let now = Utc::now();
        let inner = self.inner.read().await;
        let since = (now - inner.last_transition).num_seconds().max(0);
        let healthy = inner.state != RunState::Failed && since < staleness.as_secs() as i64;
        HealthSnapshot {
            healthy,
            seconds_since_last_transition: since,
            is_transitioning_fast: inner.recent.len() >= FAST_TRANSITION_COUNT,
            agent_state: inner.state.as_str().to_string(),
            timestamp: now.timestamp(),
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}
