use serde_json::Value;
use std::collections::VecDeque;

/// Buffers traversal candidates until the remote session description is
/// known, then drains exactly once in generation order. Two instances run
/// per session: one gating locally discovered candidates before they are
/// published, one gating received candidates before they reach the media
/// engine. Candidates are never silently discarded.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    ready: bool,
    pending: VecDeque<Value>,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a candidate. Returns it back when the queue is already
    /// draining (remote description known) so the caller delivers it
    /// immediately; otherwise it is buffered.
    pub fn push(&mut self, candidate: Value) -> Option<Value> {
        if self.ready {
            return Some(candidate);
        }
        self.pending.push_back(candidate);
        None
    }

    /// Flip to ready and hand back everything buffered, in insertion
    /// order. Only the first call drains; later calls return empty.
    pub fn mark_ready(&mut self) -> Vec<Value> {
        self.ready = true;
        self.pending.drain(..).collect()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Cleanup path: drop everything and stop accepting pass-through.
    pub fn clear(&mut self) {
        self.ready = false;
        self.pending.clear();
    }
}
