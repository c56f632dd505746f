/// Errors shared by every ovocall crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("agent error: {0}")]
    Agent(String),

    /// The completion provider answered with a non-success status.
    #[error("{provider} API error: status={status}, body={body}")]
    Provider {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("network error: {0}")]
    Transport(String),

    /// The caller aborted the in-flight request. Never surfaced to the user.
    #[error("request cancelled")]
    Cancelled,

    #[error("session error: {0}")]
    Session(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_mentions_status_and_body() {
        let err = Error::Provider {
            provider: "openai".to_string(),
            status: 429,
            body: "rate limit".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("status=429"));
        assert!(text.contains("rate limit"));
        assert!(!err.is_cancelled());
    }

    #[test]
    fn cancelled_is_distinguishable() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::Transport("timed out".into()).is_cancelled());
    }
}
