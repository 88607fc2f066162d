//! Scripted collaborators for exercising the signaling core without real
//! media or push infrastructure.

use crate::media::{MediaEngine, MediaEngineEvent, MediaEventReceiver, TransportState};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;

/// Media engine double: deterministic descriptions, inspectable candidate
/// sink, manual event injection. Mirrors a real engine's constraint that
/// candidates are only accepted once the remote description is installed.
pub struct FakeMediaEngine {
    label: String,
    fail_acquire: AtomicBool,
    trickle_on_local: AtomicBool,
    acquire_delay: Mutex<Option<Duration>>,
    acquired: AtomicBool,
    closed: AtomicBool,
    local_description: Mutex<Option<String>>,
    remote_description: Mutex<Option<String>>,
    added_candidates: Mutex<Vec<Value>>,
    events: broadcast::Sender<MediaEngineEvent>,
}

impl FakeMediaEngine {
    pub fn new(label: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            label: label.into(),
            fail_acquire: AtomicBool::new(false),
            trickle_on_local: AtomicBool::new(false),
            acquire_delay: Mutex::new(None),
            acquired: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            local_description: Mutex::new(None),
            remote_description: Mutex::new(None),
            added_candidates: Mutex::new(Vec::new()),
            events,
        }
    }

    /// An engine whose capability acquisition always fails, as if the
    /// microphone permission was denied.
    pub fn refusing_capability(label: impl Into<String>) -> Self {
        let engine = Self::new(label);
        engine.fail_acquire.store(true, Ordering::SeqCst);
        engine
    }

    /// An engine that trickles a candidate the moment a local description
    /// is installed, the way real engines start gathering mid-handshake.
    pub fn trickling(label: impl Into<String>) -> Self {
        let engine = Self::new(label);
        engine.trickle_on_local.store(true, Ordering::SeqCst);
        engine
    }

    /// Hold capability acquisition open for `delay`, widening the window
    /// between a call operation starting and its first suspension point.
    pub fn set_acquire_delay(&self, delay: Duration) {
        *self.acquire_delay.lock().unwrap() = Some(delay);
    }

    pub fn emit_local_candidate(&self, candidate: Value) {
        self.events
            .send(MediaEngineEvent::LocalCandidate(candidate))
            .ok();
    }

    pub fn emit_transport_state(&self, state: TransportState) {
        self.events
            .send(MediaEngineEvent::TransportStateChange(state))
            .ok();
    }

    pub fn added_candidates(&self) -> Vec<Value> {
        self.added_candidates.lock().unwrap().clone()
    }

    pub fn remote_description(&self) -> Option<String> {
        self.remote_description.lock().unwrap().clone()
    }

    pub fn local_description(&self) -> Option<String> {
        self.local_description.lock().unwrap().clone()
    }

    pub fn was_acquired(&self) -> bool {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaEngine for FakeMediaEngine {
    async fn acquire_local_capability(&self) -> Result<()> {
        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(anyhow!("audio capability permission denied"));
        }
        let delay = *self.acquire_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.acquired.store(true, Ordering::SeqCst);
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self) -> Result<String> {
        Ok(format!("v=0 offer from {}", self.label))
    }

    async fn create_answer(&self, remote_description: &str) -> Result<String> {
        if remote_description.is_empty() {
            return Err(anyhow!("cannot answer an empty offer"));
        }
        Ok(format!("v=0 answer from {}", self.label))
    }

    async fn set_local_description(&self, description: &str) -> Result<()> {
        *self.local_description.lock().unwrap() = Some(description.to_string());
        if self.trickle_on_local.load(Ordering::SeqCst) {
            self.emit_local_candidate(json!({
                "candidate": format!("trickle:{}", self.label)
            }));
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: &str) -> Result<()> {
        *self.remote_description.lock().unwrap() = Some(description.to_string());
        Ok(())
    }

    async fn add_candidate(&self, candidate: &Value) -> Result<()> {
        if self.remote_description.lock().unwrap().is_none() {
            return Err(anyhow!("candidate before remote description"));
        }
        self.added_candidates.lock().unwrap().push(candidate.clone());
        Ok(())
    }

    fn subscribe(&self) -> MediaEventReceiver {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<()> {
        // no-op when nothing was acquired
        self.acquired.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        *self.local_description.lock().unwrap() = None;
        *self.remote_description.lock().unwrap() = None;
        Ok(())
    }
}
