use super::{SignalingStore, StoreUpdate, Subscription};
use crate::error::StoreError;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// In-process implementation of the store contract: one JSON tree plus
/// subscriber lists. Intended for tests and for embedders that bring their
/// own replication; every client sharing the same `MemoryStore` observes
/// the same tree, which is what the integration tests rely on to model two
/// independent participants.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    root: Value,
    value_subs: Vec<ValueSub>,
    child_subs: Vec<ChildSub>,
}

struct ValueSub {
    path: Vec<String>,
    tx: UnboundedSender<StoreUpdate>,
    token: CancellationToken,
}

struct ChildSub {
    path: Vec<String>,
    tx: UnboundedSender<StoreUpdate>,
    token: CancellationToken,
    seen: HashSet<String>,
}

fn split(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn get_at<'a>(root: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let mut node = root;
    for seg in segments {
        node = node.as_object()?.get(seg)?;
    }
    Some(node)
}

fn set_at(root: &mut Value, segments: &[String], value: Value) {
    if segments.is_empty() {
        *root = value;
        return;
    }
    if !root.is_object() {
        *root = Value::Object(Map::new());
    }
    let map = root.as_object_mut().unwrap();
    let key = &segments[0];
    if segments.len() == 1 {
        if value.is_null() {
            map.remove(key);
        } else {
            map.insert(key.clone(), value);
        }
        return;
    }
    let child = map.entry(key.clone()).or_insert(Value::Object(Map::new()));
    set_at(child, &segments[1..], value);
}

/// One path intersects the other when either is a prefix of the other;
/// a write then changes the value observable at the subscribed path.
fn intersects(a: &[String], b: &[String]) -> bool {
    let n = a.len().min(b.len());
    a[..n] == b[..n]
}

fn child_keys(root: &Value, segments: &[String]) -> Vec<String> {
    match get_at(root, segments).and_then(|v| v.as_object()) {
        // serde_json maps are ordered by key, so this is key order
        Some(map) => map.keys().cloned().collect(),
        None => Vec::new(),
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn notify(&mut self, written: &[String]) {
        self.value_subs
            .retain(|sub| !sub.token.is_cancelled() && !sub.tx.is_closed());
        self.child_subs
            .retain(|sub| !sub.token.is_cancelled() && !sub.tx.is_closed());

        for sub in self.value_subs.iter() {
            if !intersects(&sub.path, written) {
                continue;
            }
            let value = get_at(&self.root, &sub.path)
                .cloned()
                .unwrap_or(Value::Null);
            sub.tx
                .send(StoreUpdate {
                    path: sub.path.join("/"),
                    key: None,
                    value,
                })
                .ok();
        }

        let root = self.root.clone();
        for sub in self.child_subs.iter_mut() {
            if !intersects(&sub.path, written) {
                continue;
            }
            for key in child_keys(&root, &sub.path) {
                if !sub.seen.insert(key.clone()) {
                    continue;
                }
                let mut child_path = sub.path.clone();
                child_path.push(key.clone());
                let value = get_at(&root, &child_path).cloned().unwrap_or(Value::Null);
                sub.tx
                    .send(StoreUpdate {
                        path: sub.path.join("/"),
                        key: Some(key),
                        value,
                    })
                    .ok();
            }
        }
    }
}

#[async_trait]
impl SignalingStore for MemoryStore {
    async fn write(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let segments = split(path);
        let mut inner = self
            .inner
            .write()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        debug!(path, "store write");
        set_at(&mut inner.root, &segments, value);
        inner.notify(&segments);
        Ok(())
    }

    async fn read_once(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let segments = split(path);
        let inner = self
            .inner
            .read()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(get_at(&inner.root, &segments).cloned())
    }

    async fn subscribe_value(&self, path: &str) -> Result<Subscription, StoreError> {
        let segments = split(path);
        let (tx, rx) = unbounded_channel();
        let token = CancellationToken::new();
        let mut inner = self
            .inner
            .write()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let current = get_at(&inner.root, &segments)
            .cloned()
            .unwrap_or(Value::Null);
        tx.send(StoreUpdate {
            path: path.to_string(),
            key: None,
            value: current,
        })
        .ok();
        inner.value_subs.push(ValueSub {
            path: segments,
            tx,
            token: token.clone(),
        });
        Ok(Subscription::new(path.to_string(), rx, token))
    }

    async fn subscribe_child_added(&self, path: &str) -> Result<Subscription, StoreError> {
        let segments = split(path);
        let (tx, rx) = unbounded_channel();
        let token = CancellationToken::new();
        let mut inner = self
            .inner
            .write()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let mut seen = HashSet::new();
        for key in child_keys(&inner.root, &segments) {
            let mut child_path = segments.clone();
            child_path.push(key.clone());
            let value = get_at(&inner.root, &child_path)
                .cloned()
                .unwrap_or(Value::Null);
            seen.insert(key.clone());
            tx.send(StoreUpdate {
                path: path.to_string(),
                key: Some(key),
                value,
            })
            .ok();
        }
        inner.child_subs.push(ChildSub {
            path: segments,
            tx,
            token: token.clone(),
            seen,
        });
        Ok(Subscription::new(path.to_string(), rx, token))
    }
}
