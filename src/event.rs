use crate::call::CallSession;
use serde::{Deserialize, Serialize};

/// Why an answered or ringing call reached `ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EndReason {
    /// Local hangup via `end_call`.
    Hangup,
    /// The remote participant wrote the terminal status.
    RemoteHangup,
    /// The media transport reported disconnected/failed while answered.
    TransportFailure,
}

/// CallEvent represents the lifecycle notifications delivered to the
/// application. Terminal events fire at most once per call id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "event",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum CallEvent {
    /// A fresh ringing record from another user was observed.
    Incoming { call: CallSession, timestamp: u64 },

    /// The call was answered (locally or by the remote side).
    Answered {
        call_id: String,
        answered_at: u64,
        timestamp: u64,
    },

    /// The callee declined before answering.
    Declined { call_id: String, timestamp: u64 },

    /// The ringing window expired without an answer.
    Missed { call_id: String, timestamp: u64 },

    /// The call reached `ended`.
    Ended {
        call_id: String,
        reason: EndReason,
        duration: u64,
        timestamp: u64,
    },

    /// Asynchronous failure tied to a session (never fatal to the process).
    Error {
        call_id: Option<String>,
        message: String,
        timestamp: u64,
    },
}

impl CallEvent {
    pub fn timestamp(&self) -> u64 {
        match self {
            CallEvent::Incoming { timestamp, .. } => *timestamp,
            CallEvent::Answered { timestamp, .. } => *timestamp,
            CallEvent::Declined { timestamp, .. } => *timestamp,
            CallEvent::Missed { timestamp, .. } => *timestamp,
            CallEvent::Ended { timestamp, .. } => *timestamp,
            CallEvent::Error { timestamp, .. } => *timestamp,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        match self {
            CallEvent::Incoming { call, .. } => Some(call.id.as_str()),
            CallEvent::Answered { call_id, .. } => Some(call_id.as_str()),
            CallEvent::Declined { call_id, .. } => Some(call_id.as_str()),
            CallEvent::Missed { call_id, .. } => Some(call_id.as_str()),
            CallEvent::Ended { call_id, .. } => Some(call_id.as_str()),
            CallEvent::Error { call_id, .. } => call_id.as_deref(),
        }
    }
}

/// Type alias for the event sender
pub type EventSender = tokio::sync::broadcast::Sender<CallEvent>;

/// Type alias for the event receiver
pub type EventReceiver = tokio::sync::broadcast::Receiver<CallEvent>;
