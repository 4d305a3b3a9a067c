use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    #[error("Admission queue full: limit {limit} reached")]
    QueueFull { limit: usize },

    #[error("Call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Missing credentials: {}", .0.join(", "))]
    AuthMissing(Vec<String>),

    #[error("Persistent connection is not open")]
    NotConnected,

    #[error("Call discarded by forced cleanup")]
    Cleared,

    #[error("Call failed: {0}")]
    Call(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl NetError {
    /// True for errors produced by a deadline rather than by the call itself.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, NetError>;

impl<T> From<std::sync::PoisonError<T>> for NetError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Io(format!("lock poisoned: {}", err))
    }
}

impl From<std::io::Error> for NetError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for NetError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for NetError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            // reqwest does not expose the configured deadline
            Self::Timeout { timeout_ms: 0 }
        } else {
            Self::Call(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for NetError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_missing_lists_keys() {
        let err = NetError::AuthMissing(vec!["token".into(), "store-id".into()]);
        assert_eq!(err.to_string(), "Missing credentials: token, store-id");
    }

    #[test]
    fn test_is_timeout() {
        assert!(NetError::Timeout { timeout_ms: 100 }.is_timeout());
        assert!(!NetError::QueueFull { limit: 1 }.is_timeout());
    }
}
