use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A broadcast engine event consumed by the HTTP surface. `kind` is a
/// dotted topic such as `run.state`, `run.receipt`, or `run.finished`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub properties: Value,
    pub at: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(kind: impl Into<String>, properties: Value) -> Self {
        Self {
            kind: kind.into(),
            properties,
            at: Utc::now(),
        }
    }
}
