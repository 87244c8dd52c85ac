use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("hub returned errors: {0}")]
    Graphql(String),
    #[error("submission rejected ({status}): {detail}")]
    Rejected { status: u16, detail: String },
    #[error("unexpected response shape: {0}")]
    Decode(String),
}

impl SnapshotError {
    /// Rejections are final; timeouts and transport failures may be
    /// retried by the caller's backoff policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SnapshotError::Timeout(_) | SnapshotError::Transport(_)
        )
    }

    pub fn from_reqwest(err: reqwest::Error, deadline: Duration) -> Self {
        if err.is_timeout() {
            SnapshotError::Timeout(deadline)
        } else {
            SnapshotError::Transport(err.to_string())
        }
    }
}
