use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

/// Connectivity of the negotiated media transport, as reported by the
/// engine after the handshake completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// A state that terminates an answered call through the normal
    /// hangup path.
    pub fn is_broken(&self) -> bool {
        matches!(self, TransportState::Disconnected | TransportState::Failed)
    }
}

#[derive(Debug, Clone)]
pub enum MediaEngineEvent {
    /// A locally discovered traversal candidate to publish to the peer.
    LocalCandidate(Value),
    TransportStateChange(TransportState),
}

/// Type alias for the media engine event receiver
pub type MediaEventReceiver = broadcast::Receiver<MediaEngineEvent>;

/// The local media-capture/negotiation engine, driven but not implemented
/// by this crate. Session descriptions and candidates are opaque here.
///
/// The capability acquired by `acquire_local_capability` and the
/// negotiation handle are exclusively owned by the active call session;
/// `close` releases both and must be a no-op when nothing was acquired,
/// since cleanup runs on every terminal path including declines where the
/// engine was never touched.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Acquire the local audio capability (microphone-equivalent).
    /// Failure here must leave the engine untouched.
    async fn acquire_local_capability(&self) -> Result<()>;

    async fn create_offer(&self) -> Result<String>;

    async fn create_answer(&self, remote_description: &str) -> Result<String>;

    async fn set_local_description(&self, description: &str) -> Result<()>;

    async fn set_remote_description(&self, description: &str) -> Result<()>;

    async fn add_candidate(&self, candidate: &Value) -> Result<()>;

    /// Subscribe to candidate discovery and transport state changes.
    fn subscribe(&self) -> MediaEventReceiver;

    /// Release the capability and the negotiation/transport handle.
    /// Idempotent; safe to call when nothing was acquired.
    async fn close(&self) -> Result<()>;
}
