//! Backend error types

use thiserror::Error;

/// Error types for backend calls
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout after {0} seconds")]
    Timeout(u64),

    #[error("No target host for '{0}'")]
    NoTarget(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Timeout(0)
        } else {
            BackendError::Transport(err.to_string())
        }
    }
}
