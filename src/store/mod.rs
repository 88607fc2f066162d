use crate::error::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

pub mod memory;
pub use memory::MemoryStore;


/// A single notification from a store subscription.
///
/// For value subscriptions `key` is `None` and `value` is the current value
/// at the subscribed path (JSON null when absent). For child subscriptions
/// `key` is the immediate child key and `value` its value.
#[derive(Debug, Clone)]
pub struct StoreUpdate {
    pub path: String,
    pub key: Option<String>,
    pub value: Value,
}

/// Handle to an active subscription. Dropping it (or calling
/// `unsubscribe`) stops delivery; the receiver then drains and closes.
pub struct Subscription {
    pub path: String,
    pub receiver: UnboundedReceiver<StoreUpdate>,
    token: CancellationToken,
}

impl Subscription {
    pub fn new(path: String, receiver: UnboundedReceiver<StoreUpdate>, token: CancellationToken) -> Self {
        Self {
            path,
            receiver,
            token,
        }
    }

    pub fn unsubscribe(&self) {
        self.token.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Contract over the shared, subscribable key-value store used as the only
/// transport for call coordination.
///
/// Paths are slash-separated; values are JSON. There is no ordering or
/// atomicity guarantee across writes to different paths, so multi-field
/// updates must be treated as independently observable.
#[async_trait]
pub trait SignalingStore: Send + Sync {
    /// Upsert `value` at `path`, creating intermediate nodes. Writing an
    /// object replaces the whole subtree at that path.
    async fn write(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// One-shot read of the value at `path`.
    async fn read_once(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Subscribe to the value at `path`. The current value is delivered
    /// immediately (JSON null when absent), then again after every write
    /// that lands at, above, or under the path. A write may be delivered
    /// even when it leaves the observed value unchanged; subscribers must
    /// tolerate re-delivery.
    async fn subscribe_value(&self, path: &str) -> Result<Subscription, StoreError>;

    /// Subscribe to immediate children of `path`. Existing children are
    /// replayed in key order at subscribe time; afterwards each newly
    /// created child is delivered exactly once.
    ///
    /// The replay is load-bearing for candidate exchange: a participant
    /// subscribing after candidates were already written must still
    /// observe every one of them.
    async fn subscribe_child_added(&self, path: &str) -> Result<Subscription, StoreError>;
}
