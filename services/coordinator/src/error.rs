use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP {status}")]
    Rejected { status: u16 },

    #[error("server does not expose native model state")]
    ProtocolMismatch,

    #[error("malformed stream frame: {0}")]
    MalformedFrame(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("model did not become ready within {0:?}")]
    LoadTimeout(Duration),

    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoordError>;

impl CoordError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoordError::Cancelled)
    }

    /// Worth another attempt: 5xx, timeouts, dropped connections.
    pub fn is_transient(&self) -> bool {
        match self {
            CoordError::Rejected { status } => *status >= 500,
            CoordError::Network(e) => e.is_timeout() || e.is_connect() || e.is_body(),
            _ => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            CoordError::Rejected { status } => Some(*status),
            CoordError::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
