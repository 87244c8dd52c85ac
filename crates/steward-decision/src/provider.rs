use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),
    #[error("provider transport failure: {0}")]
    Transport(String),
    #[error("provider returned {status}: {detail}")]
    Status { status: u16, detail: String },
    #[error("provider response missing completion text")]
    EmptyCompletion,
    #[error("cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Timeout(_) | ProviderError::Transport(_) => true,
            ProviderError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Seam to the external AI backend. Implementations return the raw
/// completion text; schema enforcement happens in the decision engine.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError>;
}

/// Chat-completions provider for any OpenAI-compatible endpoint.
pub struct OpenAiCompatProvider {
    http: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    deadline: Duration,
}

impl OpenAiCompatProvider {
    pub fn new(
        url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        deadline: Duration,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            api_key: api_key.into(),
            model: model.into(),
            deadline,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.url.trim_end_matches('/'))
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatProvider {
    async fn complete(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let body = json!({
            "model": self.model,
            "messages": [
                {
                    "role": "system",
                    "content": "You are a governance analyst. Reply with a single JSON object and nothing else."
                },
                { "role": "user", "content": prompt }
            ],
            "temperature": 0.2,
            "response_format": { "type": "json_object" }
        });

        let request = self
            .http
            .post(self.endpoint())
            .timeout(self.deadline)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            response = request => response.map_err(|err| {
                if err.is_timeout() {
                    ProviderError::Timeout(self.deadline)
                } else {
                    ProviderError::Transport(err.to_string())
                }
            })?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Status {
                status: status.as_u16(),
                detail: response.text().await.unwrap_or_default(),
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .ok_or(ProviderError::EmptyCompletion)
    }
}
