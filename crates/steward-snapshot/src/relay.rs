use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::SnapshotError;

/// Signed vote submission as the sequencer expects it: the signer address,
/// the typed-data signature, and the full typed-data payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteEnvelope {
    pub address: String,
    pub sig: String,
    pub data: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayReceipt {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub ipfs: Option<String>,
}

/// POSTs signed envelopes to the vote sequencer. Single-shot; the executor
/// owns the retry budget and never replays a rejected envelope.
pub struct RelayClient {
    http: reqwest::Client,
    relay_url: String,
    deadline: Duration,
}

impl RelayClient {
    pub fn new(relay_url: impl Into<String>, deadline: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            relay_url: relay_url.into(),
            deadline,
        }
    }

    pub async fn submit(&self, envelope: &VoteEnvelope) -> Result<RelayReceipt, SnapshotError> {
        let response = self
            .http
            .post(&self.relay_url)
            .timeout(self.deadline)
            .json(envelope)
            .send()
            .await
            .map_err(|err| SnapshotError::from_reqwest(err, self.deadline))?;

        let status = response.status();
        if status.is_success() {
            let receipt = response.json::<RelayReceipt>().await.unwrap_or_default();
            debug!(relay_id = ?receipt.id, "vote envelope accepted");
            return Ok(receipt);
        }
        let detail = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            return Err(SnapshotError::Rejected {
                status: status.as_u16(),
                detail,
            });
        }
        Err(SnapshotError::Transport(format!(
            "relay returned {status}: {detail}"
        )))
    }
}
