use super::candidates::CandidateQueue;
use crate::media::MediaEngine;
use anyhow::Result;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::debug;

struct QueuePair {
    /// Locally discovered candidates awaiting publication to the store.
    local: CandidateQueue,
    /// Received candidates awaiting delivery to the media engine.
    received: CandidateQueue,
}

/// Drives the media engine through the offer/answer handshake and gates
/// candidate flow in both directions on remote-description availability.
///
/// Exactly two things are visible from the outside: a produced local
/// description (the session publishes it) and the remote description
/// becoming available (both queues drain once). Everything else stays
/// inside the engine.
pub struct NegotiationDriver {
    engine: Arc<dyn MediaEngine>,
    queues: Mutex<QueuePair>,
}

impl NegotiationDriver {
    pub fn new(engine: Arc<dyn MediaEngine>) -> Self {
        Self {
            engine,
            queues: Mutex::new(QueuePair {
                local: CandidateQueue::new(),
                received: CandidateQueue::new(),
            }),
        }
    }

    pub fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.engine
    }

    /// Caller side: produce and install the local offer.
    pub async fn start_outgoing(&self) -> Result<String> {
        let offer = self.engine.create_offer().await?;
        self.engine.set_local_description(&offer).await?;
        Ok(offer)
    }

    /// Caller side: the remote answer arrived. Installs it, flushes every
    /// queued received candidate into the engine, and returns the locally
    /// queued candidates for the session to publish, in generation order.
    pub async fn accept_answer(&self, answer: &str) -> Result<Vec<Value>> {
        self.engine.set_remote_description(answer).await?;
        self.drain_after_remote().await
    }

    /// Callee side: consume the pending offer and produce the answer.
    /// Returns the answer plus the locally queued candidates to publish.
    pub async fn start_incoming(&self, offer: &str) -> Result<(String, Vec<Value>)> {
        self.engine.set_remote_description(offer).await?;
        let answer = self.engine.create_answer(offer).await?;
        self.engine.set_local_description(&answer).await?;
        let to_publish = self.drain_after_remote().await?;
        Ok((answer, to_publish))
    }

    async fn drain_after_remote(&self) -> Result<Vec<Value>> {
        let (to_engine, to_publish) = {
            let mut queues = self.queues.lock().unwrap();
            (queues.received.mark_ready(), queues.local.mark_ready())
        };
        if !to_engine.is_empty() || !to_publish.is_empty() {
            debug!(
                received = to_engine.len(),
                local = to_publish.len(),
                "draining queued candidates after remote description"
            );
        }
        for candidate in to_engine.iter() {
            self.engine.add_candidate(candidate).await?;
        }
        Ok(to_publish)
    }

    /// A candidate was discovered locally. Returns it when it should be
    /// published right away; `None` means it was queued.
    pub fn on_local_candidate(&self, candidate: Value) -> Option<Value> {
        self.queues.lock().unwrap().local.push(candidate)
    }

    /// A candidate arrived from the peer. Queued until the remote
    /// description is installed, delivered to the engine afterwards.
    pub async fn on_remote_candidate(&self, candidate: Value) -> Result<()> {
        let pass_through = self.queues.lock().unwrap().received.push(candidate);
        if let Some(candidate) = pass_through {
            self.engine.add_candidate(&candidate).await?;
        }
        Ok(())
    }

    /// Cleanup path: both queues emptied, gating reset.
    pub fn reset(&self) {
        let mut queues = self.queues.lock().unwrap();
        queues.local.clear();
        queues.received.clear();
    }
}
