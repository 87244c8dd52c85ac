use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum VoteError {
    #[error("signer failure: {0}")]
    Signer(String),
    #[error("payload encoding failed: {0}")]
    Encode(String),
    #[error("submission rejected: {0}")]
    Rejected(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("submission timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl VoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, VoteError::Transport(_) | VoteError::Timeout(_))
    }

    pub fn from_reqwest(err: reqwest::Error, deadline: Duration) -> Self {
        if err.is_timeout() {
            VoteError::Timeout(deadline)
        } else {
            VoteError::Transport(err.to_string())
        }
    }
}
