use crate::{CallId, ConversationId, UserId};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

pub mod candidates;
pub mod client;
pub mod negotiate;
pub mod session;
pub mod timeout;

pub use client::{CallClient, CallClientBuilder, CallListener};
pub use session::{ActiveCall, ActiveCallRef};

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Answered,
    Declined,
    Ended,
    Missed,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Declined | CallStatus::Ended | CallStatus::Missed
        )
    }

    /// The full transition table. Status only moves forward; terminal
    /// states accept nothing.
    pub fn can_transition_to(&self, next: CallStatus) -> bool {
        matches!(
            (self, next),
            (
                CallStatus::Ringing,
                CallStatus::Answered | CallStatus::Declined | CallStatus::Missed | CallStatus::Ended
            ) | (CallStatus::Answered, CallStatus::Ended)
        )
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Answered => "answered",
            CallStatus::Declined => "declined",
            CallStatus::Ended => "ended",
            CallStatus::Missed => "missed",
        };
        write!(f, "{}", s)
    }
}

/// The single logical record for one call attempt, mirrored under both
/// participants' namespaces in the store. Candidates are exchanged through
/// the `candidates/` subpath and never serialized into the record, so
/// field-level writes cannot clobber them.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub id: CallId,
    pub conversation_id: ConversationId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub caller_name: String,
    pub status: CallStatus,
    pub created_at: u64,
    pub answered_at: Option<u64>,
    pub ended_at: Option<u64>,
    /// Seconds between answer and end; zero when never answered.
    pub duration: Option<u64>,
    pub offer: Option<String>,
    pub answer: Option<String>,
}

impl CallSession {
    pub fn remote_user<'a>(&'a self, local_user: &str) -> &'a str {
        if self.caller_id == local_user {
            &self.callee_id
        } else {
            &self.caller_id
        }
    }

    pub fn is_stale(&self, now: u64, stale_after_millis: u64) -> bool {
        now.saturating_sub(self.created_at) > stale_after_millis
    }
}

/// Outcome of running an observed status through the guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// Same status re-delivered; ignored so callbacks never double-fire.
    Duplicate,
    /// Transition table violation; ignored.
    Rejected,
}

/// Last locally-known status per call id, shared by the client operations,
/// the active session loop and the incoming-call listener. Duplicate or
/// out-of-order notifications from the store are classified here before
/// any callback fires.
///
/// Terminal entries are kept for the lifetime of the client so that a late
/// re-delivery for a finished call stays silent.
#[derive(Default)]
pub struct TransitionGuard {
    statuses: Mutex<HashMap<CallId, CallStatus>>,
}

impl TransitionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self, call_id: &str) -> Option<CallStatus> {
        self.statuses.lock().unwrap().get(call_id).copied()
    }

    /// Register a call first observed in `status` (ringing for both a new
    /// outgoing call and a surfaced incoming one).
    pub fn track(&self, call_id: &str, status: CallStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(call_id.to_string(), status);
    }

    pub fn try_apply(&self, call_id: &str, next: CallStatus) -> TransitionOutcome {
        let mut statuses = self.statuses.lock().unwrap();
        let current = match statuses.get(call_id) {
            Some(current) => *current,
            None => {
                statuses.insert(call_id.to_string(), next);
                return TransitionOutcome::Applied;
            }
        };
        if current == next {
            debug!(call_id, status = %next, "duplicate transition ignored");
            return TransitionOutcome::Duplicate;
        }
        if !current.can_transition_to(next) {
            warn!(call_id, from = %current, to = %next, "rejected transition");
            return TransitionOutcome::Rejected;
        }
        statuses.insert(call_id.to_string(), next);
        TransitionOutcome::Applied
    }
}

/// Store layout helpers. Every field lives under both participants'
/// namespaces for the same call id.
pub mod paths {
    pub fn call_root(owner: &str, call_id: &str) -> String {
        format!("calls/{}/{}", owner, call_id)
    }

    pub fn user_root(owner: &str) -> String {
        format!("calls/{}", owner)
    }

    pub fn status(owner: &str, call_id: &str) -> String {
        format!("calls/{}/{}/status", owner, call_id)
    }

    pub fn offer(owner: &str, call_id: &str) -> String {
        format!("calls/{}/{}/offer", owner, call_id)
    }

    pub fn answer(owner: &str, call_id: &str) -> String {
        format!("calls/{}/{}/answer", owner, call_id)
    }

    pub fn answered_at(owner: &str, call_id: &str) -> String {
        format!("calls/{}/{}/answeredAt", owner, call_id)
    }

    pub fn ended_at(owner: &str, call_id: &str) -> String {
        format!("calls/{}/{}/endedAt", owner, call_id)
    }

    pub fn duration(owner: &str, call_id: &str) -> String {
        format!("calls/{}/{}/duration", owner, call_id)
    }

    pub fn candidates(owner: &str, call_id: &str) -> String {
        format!("calls/{}/{}/candidates", owner, call_id)
    }

    pub fn candidate(owner: &str, call_id: &str, key: &str) -> String {
        format!("calls/{}/{}/candidates/{}", owner, call_id, key)
    }
}
