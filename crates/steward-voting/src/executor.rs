use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ethers::types::Address;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use steward_snapshot::{RelayClient, SnapshotError, VoteEnvelope};
use steward_types::{ExecutionPath, ReceiptOutcome, VoteDecision, VoteReceipt};

use crate::error::VoteError;
use crate::safe::SafeClient;
use crate::signer::{address_hex, VoteSigner};
use crate::typed_data::{build_vote_typed_data, parse_proposal_uint};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
        }
    }
}

/// Turns a decision into a signed submission on the configured path and
/// reports the outcome as a receipt. Every failure mode lands in the
/// receipt; the only error this returns is cancellation, so the caller can
/// stop cleanly at a checkpoint boundary.
pub struct VoteExecutor {
    signer: Arc<dyn VoteSigner>,
    relay: RelayClient,
    safe: Option<Arc<SafeClient>>,
    governors: HashMap<String, Address>,
    config: ExecutorConfig,
}

impl VoteExecutor {
    pub fn new(
        signer: Arc<dyn VoteSigner>,
        relay: RelayClient,
        safe: Option<Arc<SafeClient>>,
        governors: HashMap<String, Address>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            signer,
            relay,
            safe,
            governors,
            config,
        }
    }

    pub fn safe_client(&self) -> Option<&Arc<SafeClient>> {
        self.safe.as_ref()
    }

    pub fn signer(&self) -> &Arc<dyn VoteSigner> {
        &self.signer
    }

    pub async fn cast(
        &self,
        decision: &VoteDecision,
        space: &str,
        path: ExecutionPath,
        cancel: &CancellationToken,
    ) -> Result<VoteReceipt, VoteError> {
        match path {
            ExecutionPath::DryRun => Ok(VoteReceipt::skipped(
                &decision.proposal_id,
                ExecutionPath::DryRun,
                "dry_run",
            )),
            ExecutionPath::Eoa => self.cast_eoa(decision, space, cancel).await,
            ExecutionPath::Safe => self.cast_safe(decision, space, cancel).await,
        }
    }

    async fn cast_eoa(
        &self,
        decision: &VoteDecision,
        space: &str,
        cancel: &CancellationToken,
    ) -> Result<VoteReceipt, VoteError> {
        let timestamp = Utc::now().timestamp();
        let (typed, raw) = match build_vote_typed_data(
            self.signer.address(),
            space,
            &decision.proposal_id,
            decision.choice_index,
            timestamp,
            "",
        ) {
            Ok(built) => built,
            Err(err) => return Ok(self.error_receipt(decision, ExecutionPath::Eoa, &err)),
        };

        let signature = match self.signer.sign_typed_data(&typed).await {
            Ok(signature) => signature,
            Err(err) => return Ok(self.error_receipt(decision, ExecutionPath::Eoa, &err)),
        };
        let sig_hex = format!("0x{signature}");
        let envelope = VoteEnvelope {
            address: address_hex(self.signer.address()),
            sig: sig_hex.clone(),
            data: raw,
        };

        let mut attempt = 0u32;
        loop {
            let submit = self.relay.submit(&envelope);
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(VoteError::Cancelled),
                result = submit => result,
            };
            match result {
                Ok(_) => {
                    debug!(proposal_id = %decision.proposal_id, "vote envelope submitted");
                    return Ok(VoteReceipt {
                        proposal_id: decision.proposal_id.clone(),
                        path: ExecutionPath::Eoa,
                        outcome: ReceiptOutcome::Submitted,
                        transport_ref: Some(sig_hex),
                        submitted_at: Utc::now(),
                    });
                }
                Err(SnapshotError::Rejected { status, detail }) => {
                    return Ok(VoteReceipt {
                        proposal_id: decision.proposal_id.clone(),
                        path: ExecutionPath::Eoa,
                        outcome: ReceiptOutcome::Rejected {
                            reason: format!("{status}: {detail}"),
                        },
                        transport_ref: Some(sig_hex),
                        submitted_at: Utc::now(),
                    });
                }
                Err(err) if err.is_retryable() && attempt + 1 < self.config.max_attempts => {
                    attempt += 1;
                    self.backoff(attempt, cancel).await?;
                }
                Err(err) => {
                    warn!(proposal_id = %decision.proposal_id, error = %err, "vote submission failed");
                    return Ok(VoteReceipt {
                        proposal_id: decision.proposal_id.clone(),
                        path: ExecutionPath::Eoa,
                        outcome: ReceiptOutcome::Error {
                            reason: err.to_string(),
                        },
                        transport_ref: Some(sig_hex),
                        submitted_at: Utc::now(),
                    });
                }
            }
        }
    }

    async fn cast_safe(
        &self,
        decision: &VoteDecision,
        space: &str,
        cancel: &CancellationToken,
    ) -> Result<VoteReceipt, VoteError> {
        let Some(safe) = self.safe.as_ref() else {
            return Ok(self.error_receipt(
                decision,
                ExecutionPath::Safe,
                &VoteError::Encode("safe path selected but no safe is configured".to_string()),
            ));
        };
        let Some(governor) = self.governors.get(space).copied() else {
            return Ok(self.error_receipt(
                decision,
                ExecutionPath::Safe,
                &VoteError::Encode(format!("no governor configured for space `{space}`")),
            ));
        };

        let proposal_uint = match parse_proposal_uint(&decision.proposal_id) {
            Ok(value) => value,
            Err(err) => return Ok(self.error_receipt(decision, ExecutionPath::Safe, &err)),
        };
        let Some(support) = governor_support(&decision.choice_label) else {
            return Ok(self.error_receipt(
                decision,
                ExecutionPath::Safe,
                &VoteError::Encode(format!(
                    "choice `{}` has no governor support mapping",
                    decision.choice_label
                )),
            ));
        };
        let data = SafeClient::encode_cast_vote(proposal_uint, support, Some(&decision.reasoning));

        let nonce = {
            let fetch = safe.fetch_nonce();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(VoteError::Cancelled),
                result = fetch => match result {
                    Ok(nonce) => nonce,
                    Err(err) => {
                        return Ok(self.error_receipt(decision, ExecutionPath::Safe, &err))
                    }
                },
            }
        };
        let tx = safe.build_transaction(governor, data, nonce);

        let mut attempt = 0u32;
        loop {
            let propose = safe.propose(self.signer.as_ref(), &tx);
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(VoteError::Cancelled),
                result = propose => result,
            };
            match result {
                Ok(tx_hash) => {
                    debug!(proposal_id = %decision.proposal_id, tx_hash, "safe vote proposed");
                    return Ok(VoteReceipt {
                        proposal_id: decision.proposal_id.clone(),
                        path: ExecutionPath::Safe,
                        outcome: ReceiptOutcome::Submitted,
                        transport_ref: Some(tx_hash),
                        submitted_at: Utc::now(),
                    });
                }
                Err(VoteError::Rejected(reason)) => {
                    return Ok(VoteReceipt {
                        proposal_id: decision.proposal_id.clone(),
                        path: ExecutionPath::Safe,
                        outcome: ReceiptOutcome::Rejected { reason },
                        transport_ref: None,
                        submitted_at: Utc::now(),
                    });
                }
                Err(err) if err.is_retryable() && attempt + 1 < self.config.max_attempts => {
                    attempt += 1;
                    self.backoff(attempt, cancel).await?;
                }
                Err(err) => {
                    warn!(proposal_id = %decision.proposal_id, error = %err, "safe submission failed");
                    return Ok(self.error_receipt(decision, ExecutionPath::Safe, &err));
                }
            }
        }
    }

    fn error_receipt(
        &self,
        decision: &VoteDecision,
        path: ExecutionPath,
        err: &VoteError,
    ) -> VoteReceipt {
        VoteReceipt {
            proposal_id: decision.proposal_id.clone(),
            path,
            outcome: ReceiptOutcome::Error {
                reason: err.to_string(),
            },
            transport_ref: None,
            submitted_at: Utc::now(),
        }
    }

    async fn backoff(&self, attempt: u32, cancel: &CancellationToken) -> Result<(), VoteError> {
        let exp = self
            .config
            .base_backoff
            .saturating_mul(1u32 << attempt.min(6));
        let jitter = if exp.is_zero() {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=(exp.as_millis() as u64) / 2))
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(VoteError::Cancelled),
            _ = tokio::time::sleep(exp + jitter) => Ok(()),
        }
    }
}

/// Governor support codes (0 = Against, 1 = For, 2 = Abstain) keyed by the
/// decided choice label. The hub orders a proposal's choices arbitrarily,
/// so the position in that array carries no meaning on-chain; labels that
/// map to none of the three codes cannot be cast through a governor.
fn governor_support(choice_label: &str) -> Option<u8> {
    match choice_label.trim().to_ascii_lowercase().as_str() {
        "against" | "no" | "nay" => Some(0),
        "for" | "yes" | "yea" | "aye" => Some(1),
        "abstain" => Some(2),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::signer::tests::DEV_KEY;
    use crate::signer::LocalWalletSigner;

    fn decision() -> VoteDecision {
        VoteDecision {
            proposal_id: "0x1f".to_string(),
            choice_index: 1,
            choice_label: "For".to_string(),
            confidence: 0.8,
            reasoning: "bounded impact".to_string(),
            risk_level: steward_types::RiskLevel::Low,
            strategy: steward_types::VotingStrategy::Balanced,
            key_factors: vec![],
        }
    }

    fn executor(safe: Option<Arc<SafeClient>>) -> VoteExecutor {
        let signer = Arc::new(LocalWalletSigner::from_private_key(DEV_KEY, 1).expect("signer"));
        VoteExecutor::new(
            signer,
            // Unroutable relay; tests never reach a live endpoint.
            RelayClient::new("http://127.0.0.1:1/", Duration::from_millis(200)),
            safe,
            HashMap::new(),
            ExecutorConfig {
                max_attempts: 2,
                base_backoff: Duration::ZERO,
            },
        )
    }

    #[tokio::test]
    async fn dry_run_skips_without_signing_or_io() {
        let receipt = executor(None)
            .cast(
                &decision(),
                "dao.eth",
                ExecutionPath::DryRun,
                &CancellationToken::new(),
            )
            .await
            .expect("cast");
        assert_eq!(receipt.path, ExecutionPath::DryRun);
        assert_eq!(
            receipt.outcome,
            ReceiptOutcome::Skipped {
                reason: "dry_run".to_string()
            }
        );
        assert!(receipt.transport_ref.is_none());
    }

    #[tokio::test]
    async fn unconfigured_safe_path_reports_an_error_receipt() {
        let receipt = executor(None)
            .cast(
                &decision(),
                "dao.eth",
                ExecutionPath::Safe,
                &CancellationToken::new(),
            )
            .await
            .expect("cast");
        assert!(matches!(receipt.outcome, ReceiptOutcome::Error { .. }));
    }

    #[tokio::test]
    async fn unreachable_relay_exhausts_retries_into_an_error_receipt() {
        let receipt = executor(None)
            .cast(
                &decision(),
                "dao.eth",
                ExecutionPath::Eoa,
                &CancellationToken::new(),
            )
            .await
            .expect("cast");
        assert!(receipt.outcome.is_error());
        // The envelope was signed even though submission failed.
        assert!(receipt.transport_ref.is_some());
    }

    #[tokio::test]
    async fn cancelled_submission_surfaces_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = executor(None)
            .cast(&decision(), "dao.eth", ExecutionPath::Eoa, &cancel)
            .await;
        assert!(matches!(result, Err(VoteError::Cancelled)));
    }

    #[test]
    fn governor_support_goes_by_label_not_position() {
        // Conventional hub ordering: For is choice 1 but support code 1,
        // Against is choice 2 but support code 0.
        assert_eq!(governor_support("For"), Some(1));
        assert_eq!(governor_support("Against"), Some(0));
        assert_eq!(governor_support("Abstain"), Some(2));
        // Case and whitespace do not matter; synonyms map too.
        assert_eq!(governor_support(" against "), Some(0));
        assert_eq!(governor_support("YES"), Some(1));
        assert_eq!(governor_support("nay"), Some(0));
        // Free-form choices have no on-chain support code.
        assert_eq!(governor_support("Option 3"), None);
        assert_eq!(governor_support("Fund 500k"), None);
    }

    #[tokio::test]
    async fn unmappable_choice_label_errors_before_any_submission() {
        let safe = Arc::new(SafeClient::new(
            "http://127.0.0.1:1/",
            "0x00000000000000000000000000000000000000F0"
                .parse()
                .expect("address"),
            1,
            Duration::from_millis(200),
        ));
        let signer = Arc::new(LocalWalletSigner::from_private_key(DEV_KEY, 1).expect("signer"));
        let governors = HashMap::from([(
            "dao.eth".to_string(),
            "0x00000000000000000000000000000000000000aa"
                .parse()
                .expect("address"),
        )]);
        let executor = VoteExecutor::new(
            signer,
            RelayClient::new("http://127.0.0.1:1/", Duration::from_millis(200)),
            Some(safe),
            governors,
            ExecutorConfig {
                max_attempts: 2,
                base_backoff: Duration::ZERO,
            },
        );

        let mut decision = decision();
        decision.choice_index = 3;
        decision.choice_label = "Option 3".to_string();
        let receipt = executor
            .cast(
                &decision,
                "dao.eth",
                ExecutionPath::Safe,
                &CancellationToken::new(),
            )
            .await
            .expect("cast");
        assert!(matches!(
            &receipt.outcome,
            ReceiptOutcome::Error { reason } if reason.contains("no governor support mapping")
        ));
        assert!(receipt.transport_ref.is_none());
    }
}
