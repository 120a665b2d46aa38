//! Stream layer error types.

use thiserror::Error;

use crate::lifecycle::ConnectionState;

/// Stream layer error type.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("http status {status}: {body}")]
    Http { status: u16, body: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("subscription already active (state: {})", state.as_str())]
    AlreadyActive { state: ConnectionState },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StreamError {
    /// Errors that the reconnect loop treats as a dropped transport.
    #[must_use]
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Http { .. } | Self::Request(_) | Self::Read(_)
        )
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(error: reqwest::Error) -> Self {
        if let Some(status) = error.status() {
            return Self::Http {
                status: status.as_u16(),
                body: error.to_string(),
            };
        }
        Self::Request(error.to_string())
    }
}

/// Stream layer result type.
pub type Result<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::StreamError;
    use crate::lifecycle::ConnectionState;

    #[test]
    fn already_active_names_the_blocking_state() {
        let error = StreamError::AlreadyActive {
            state: ConnectionState::Connecting,
        };
        assert_eq!(
            error.to_string(),
            "subscription already active (state: connecting)"
        );
        assert!(!error.is_transport_failure());
    }

    #[test]
    fn http_and_transport_errors_are_transport_failures() {
        assert!(StreamError::Transport("reset".to_string()).is_transport_failure());
        assert!(
            StreamError::Http {
                status: 502,
                body: "bad gateway".to_string()
            }
            .is_transport_failure()
        );
        assert!(!StreamError::InvalidConfig("x".to_string()).is_transport_failure());
    }
}
