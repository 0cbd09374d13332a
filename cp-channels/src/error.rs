use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChannelError>;

/// Failures surfaced by a chat surface after its own internal retries.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Control not found, clipboard race and similar; the next cycle may succeed.
    #[error("transient: {0}")]
    Transient(String),

    /// The conversation window is gone and must be re-acquired.
    #[error("conversation unavailable: {0}")]
    Unavailable(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unexpected bridge payload: {0}")]
    Protocol(String),

    #[error("http error: {0}")]
    Http(String),
}

impl ChannelError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<reqwest::Error> for ChannelError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_decode() {
            Self::Protocol(e.to_string())
        } else {
            Self::Http(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}
