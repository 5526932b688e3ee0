//! Error types for the linkstream-upstream crate

use std::time::Duration;
use thiserror::Error;

/// Result type alias using `UpstreamError`
pub type Result<T> = std::result::Result<T, UpstreamError>;

/// Errors reported by the messaging network or a collaborator
#[derive(Error, Debug, Clone)]
pub enum UpstreamError {
    /// The network throttled this credential for the given number of seconds
    #[error("flood wait: credential throttled for {seconds}s")]
    FloodWait { seconds: u64 },

    /// Request timed out
    #[error("operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// Connection dropped or could not be established
    #[error("connection error: {0}")]
    Connection(String),

    /// Credential is no longer valid
    #[error("authorization revoked: {0}")]
    AuthRevoked(String),

    /// The file reference is stale or the file was deleted upstream
    #[error("file gone: {0}")]
    FileGone(String),

    /// Nothing stored under the requested reference
    #[error("not found: {0}")]
    NotFound(String),

    /// Generic RPC failure
    #[error("rpc error: {0}")]
    Rpc(String),

    /// Collaborator backend failure (store, authorizer)
    #[error("backend error: {0}")]
    Backend(String),
}

impl UpstreamError {
    /// Whether retrying the same call on the same connection may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Connection(_) | Self::Rpc(_)
        )
    }

    /// Cooldown requested by the network, if this is a flood wait
    pub fn flood_wait(&self) -> Option<Duration> {
        match self {
            Self::FloodWait { seconds } => Some(Duration::from_secs(*seconds)),
            _ => None,
        }
    }
}

impl From<std::io::Error> for UpstreamError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => UpstreamError::Timeout { seconds: 0 },
            std::io::ErrorKind::NotFound => UpstreamError::NotFound(err.to_string()),
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => UpstreamError::Connection(err.to_string()),
            _ => UpstreamError::Backend(err.to_string()),
        }
    }
}
