use crate::call::CallClient;
use crate::config::SignalingConfig;
use crate::event::{CallEvent, EventReceiver};
use crate::fixtures::FakeMediaEngine;
use crate::store::MemoryStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

mod listener_test;
mod transition_test;

pub(crate) fn fast_config() -> SignalingConfig {
    SignalingConfig {
        ring_timeout_secs: 1,
        ..SignalingConfig::default()
    }
}

pub(crate) fn test_client(
    store: &MemoryStore,
    user: &str,
    engine: Arc<FakeMediaEngine>,
    config: SignalingConfig,
) -> CallClient {
    tracing_subscriber::fmt().with_test_writer().try_init().ok();
    CallClient::builder(user)
        .with_display_name(format!("{} display", user))
        .with_store(Arc::new(store.clone()))
        .with_media_engine(engine)
        .with_config(config)
        .build()
        .unwrap()
}

pub(crate) async fn wait_for_event<F>(receiver: &mut EventReceiver, predicate: F) -> Option<CallEvent>
where
    F: Fn(&CallEvent) -> bool + Send,
{
    let deadline = Duration::from_secs(3);
    timeout(deadline, async {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if predicate(&event) {
                        return Some(event);
                    }
                }
                Err(_) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Give spawned session loops a moment to drain their channels.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
