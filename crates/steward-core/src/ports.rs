use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use steward_decision::{DecisionEngine, DecisionError};
use steward_snapshot::{SnapshotClient, SnapshotError};
use steward_types::{
    DecisionOutcome, ExecutionPath, Proposal, VoteDecision, VoteReceipt, VotingStrategy,
};
use steward_voting::{SafeClient, VoteError, VoteExecutor, VoteSigner};

/// The orchestrator's collaborator seams. Production wiring hands it the
/// concrete clients; tests substitute deterministic fakes.
#[async_trait]
pub trait ProposalSource: Send + Sync {
    async fn active_proposals(
        &self,
        spaces: &[String],
        first: usize,
    ) -> Result<Vec<Proposal>, SnapshotError>;
}

#[async_trait]
impl ProposalSource for SnapshotClient {
    async fn active_proposals(
        &self,
        spaces: &[String],
        first: usize,
    ) -> Result<Vec<Proposal>, SnapshotError> {
        SnapshotClient::active_proposals(self, spaces, first).await
    }
}

#[async_trait]
pub trait DecisionMaker: Send + Sync {
    async fn decide(
        &self,
        proposal: &Proposal,
        strategy: VotingStrategy,
        confidence_threshold: f64,
        cancel: &CancellationToken,
    ) -> Result<DecisionOutcome, DecisionError>;
}

#[async_trait]
impl DecisionMaker for DecisionEngine {
    async fn decide(
        &self,
        proposal: &Proposal,
        strategy: VotingStrategy,
        confidence_threshold: f64,
        cancel: &CancellationToken,
    ) -> Result<DecisionOutcome, DecisionError> {
        DecisionEngine::decide(self, proposal, strategy, confidence_threshold, cancel).await
    }
}

#[async_trait]
pub trait VoteCaster: Send + Sync {
    async fn cast(
        &self,
        decision: &VoteDecision,
        space: &str,
        path: ExecutionPath,
        cancel: &CancellationToken,
    ) -> Result<VoteReceipt, VoteError>;
}

#[async_trait]
impl VoteCaster for VoteExecutor {
    async fn cast(
        &self,
        decision: &VoteDecision,
        space: &str,
        path: ExecutionPath,
        cancel: &CancellationToken,
    ) -> Result<VoteReceipt, VoteError> {
        VoteExecutor::cast(self, decision, space, path, cancel).await
    }
}

/// Produces the 0-value on-chain transaction used when a run casts no
/// on-chain vote on a day that still needs one.
#[async_trait]
pub trait LivenessSubmitter: Send + Sync {
    async fn submit_liveness_tx(&self) -> Result<String, VoteError>;
}

/// Safe-backed liveness: a self-transfer proposed through the transaction
/// service.
pub struct SafeLiveness {
    safe: Arc<SafeClient>,
    signer: Arc<dyn VoteSigner>,
}

impl SafeLiveness {
    pub fn new(safe: Arc<SafeClient>, signer: Arc<dyn VoteSigner>) -> Self {
        Self { safe, signer }
    }
}

#[async_trait]
impl LivenessSubmitter for SafeLiveness {
    async fn submit_liveness_tx(&self) -> Result<String, VoteError> {
        self.safe.self_transfer(self.signer.as_ref()).await
    }
}
