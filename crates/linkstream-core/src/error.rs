//! Error types for the linkstream-core crate

use linkstream_upstream::UpstreamError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Result type alias using `CoreError`
pub type Result<T> = std::result::Result<T, CoreError>;

/// Why the admission controller turned a request away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The class queue is at `max_queue_size`
    QueueFull,
    /// Waited in the queue longer than the queue timeout
    QueueTimeout,
    /// The controller is shutting down
    ShuttingDown,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::QueueTimeout => "queue_timeout",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while serving a stream
#[derive(Error, Debug)]
pub enum CoreError {
    /// Pool exhausted, shut down, or every client flood-waited past the wait budget
    #[error("no upstream client available: {0}")]
    ClientUnavailable(String),

    /// The upstream throttled the client serving this request
    #[error("client {client_id} flood-waited for {seconds}s")]
    FloodWaited { client_id: usize, seconds: u64 },

    /// The client's credential was revoked mid-request
    #[error("client {client_id} disabled: credential revoked")]
    ClientDisabled { client_id: usize },

    /// Transient upstream failures outlasted the retry budget
    #[error("upstream failed after {attempts} attempts: {source}")]
    UpstreamTransient {
        attempts: u32,
        #[source]
        source: UpstreamError,
    },

    /// Malformed or unsatisfiable byte range
    #[error("range not satisfiable: {reason}")]
    InvalidRange { reason: String, size: u64 },

    /// Link or file does not resolve
    #[error("not found: {0}")]
    NotFound(String),

    /// Link secret does not match the file
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Admission rejected the request
    #[error("throttled: {0}")]
    Throttled(RejectReason),

    /// Peer went away mid-stream
    #[error("client disconnected")]
    Disconnected,

    /// Non-retryable upstream failure
    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),
}

impl CoreError {
    /// Whether the session should resume on a freshly acquired client
    pub fn is_failover(&self) -> bool {
        matches!(self, Self::FloodWaited { .. } | Self::ClientDisabled { .. })
    }

    pub(crate) fn invalid_range(reason: impl Into<String>, size: u64) -> Self {
        Self::InvalidRange {
            reason: reason.into(),
            size,
        }
    }
}
