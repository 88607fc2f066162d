use crate::call::CallStatus;
use thiserror::Error;

/// Store-level failures surfaced through the `SignalingStore` contract.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures returned synchronously by the call operations.
///
/// Transport and timeout failures are never returned here; they are
/// delivered through the lifecycle event channel only.
#[derive(Debug, Error)]
pub enum CallError {
    /// Local media capability acquisition failed. No signaling write has
    /// happened and no session was created.
    #[error("media capability unavailable: {0}")]
    MediaUnavailable(String),

    /// A store write or read failed. The operation that triggered it is
    /// considered failed; the caller decides whether to retry.
    #[error("signaling write failed at {path}: {source}")]
    SignalingWrite {
        path: String,
        #[source]
        source: StoreError,
    },

    #[error("cannot {op} a call in status {status}")]
    InvalidState { op: &'static str, status: CallStatus },

    /// Exactly one locally active session is allowed per client.
    #[error("another call is already in progress")]
    CallInProgress,
}
