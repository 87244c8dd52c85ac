use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use steward_types::{Proposal, ProposalState};

use crate::error::SnapshotError;

const PROPOSALS_QUERY: &str = r#"
query Proposals($spaces: [String!], $first: Int!) {
  proposals(
    where: { space_in: $spaces, state: "active" }
    first: $first
    orderBy: "end"
    orderDirection: asc
  ) {
    id
    title
    body
    author
    start
    end
    state
    choices
    scores
    scores_total
    space { id }
  }
}
"#;

/// GraphQL client for the governance hub. One POST per fetch with a
/// per-call deadline; callers own the retry policy.
pub struct SnapshotClient {
    http: reqwest::Client,
    hub_url: String,
    deadline: Duration,
}

impl SnapshotClient {
    pub fn new(hub_url: impl Into<String>, deadline: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            hub_url: hub_url.into(),
            deadline,
        }
    }

    pub async fn active_proposals(
        &self,
        spaces: &[String],
        first: usize,
    ) -> Result<Vec<Proposal>, SnapshotError> {
        let body = json!({
            "query": PROPOSALS_QUERY,
            "variables": { "spaces": spaces, "first": first }
        });
        let response = self
            .http
            .post(&self.hub_url)
            .timeout(self.deadline)
            .json(&body)
            .send()
            .await
            .map_err(|err| SnapshotError::from_reqwest(err, self.deadline))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(SnapshotError::Transport(format!(
                "hub returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(SnapshotError::Rejected {
                status: status.as_u16(),
                detail: response.text().await.unwrap_or_default(),
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|err| SnapshotError::Decode(err.to_string()))?;
        let proposals = parse_proposals_response(&payload)?;
        debug!(count = proposals.len(), "fetched active proposals");
        Ok(proposals)
    }
}

#[derive(Debug, Deserialize)]
struct WireSpace {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WireProposal {
    id: String,
    title: String,
    #[serde(default)]
    body: String,
    author: String,
    start: i64,
    end: i64,
    state: ProposalState,
    choices: Vec<String>,
    #[serde(default)]
    scores: Vec<f64>,
    #[serde(default)]
    scores_total: f64,
    space: WireSpace,
}

impl From<WireProposal> for Proposal {
    fn from(wire: WireProposal) -> Self {
        Proposal {
            id: wire.id,
            space: wire.space.id,
            title: wire.title,
            body: wire.body,
            author: wire.author,
            start: wire.start,
            end: wire.end,
            state: wire.state,
            choices: wire.choices,
            scores: wire.scores,
            scores_total: wire.scores_total,
        }
    }
}

fn parse_proposals_response(payload: &Value) -> Result<Vec<Proposal>, SnapshotError> {
    if let Some(errors) = payload.get("errors").and_then(Value::as_array) {
        if !errors.is_empty() {
            let detail = errors
                .iter()
                .filter_map(|e| e.get("message").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(SnapshotError::Graphql(detail));
        }
    }
    let Some(raw) = payload.pointer("/data/proposals") else {
        return Err(SnapshotError::Decode(
            "missing data.proposals".to_string(),
        ));
    };
    if raw.is_null() {
        return Ok(Vec::new());
    }
    let wire: Vec<WireProposal> = serde_json::from_value(raw.clone())
        .map_err(|err| SnapshotError::Decode(err.to_string()))?;
    Ok(wire.into_iter().map(Proposal::from).collect())
}
