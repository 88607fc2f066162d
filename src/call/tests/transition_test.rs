use crate::call::{CallSession, CallStatus, TransitionGuard, TransitionOutcome};
use serde_json::json;

#[test]
fn ringing_moves_to_every_resolution() {
    for next in [
        CallStatus::Answered,
        CallStatus::Declined,
        CallStatus::Missed,
        CallStatus::Ended,
    ] {
        assert!(CallStatus::Ringing.can_transition_to(next), "{}", next);
    }
}

#[test]
fn answered_only_moves_to_ended() {
    assert!(CallStatus::Answered.can_transition_to(CallStatus::Ended));
    for next in [
        CallStatus::Ringing,
        CallStatus::Declined,
        CallStatus::Missed,
        CallStatus::Answered,
    ] {
        assert!(!CallStatus::Answered.can_transition_to(next), "{}", next);
    }
}

#[test]
fn terminal_states_accept_nothing() {
    for terminal in [CallStatus::Declined, CallStatus::Ended, CallStatus::Missed] {
        assert!(terminal.is_terminal());
        for next in [
            CallStatus::Ringing,
            CallStatus::Answered,
            CallStatus::Declined,
            CallStatus::Ended,
            CallStatus::Missed,
        ] {
            assert!(!terminal.can_transition_to(next), "{} -> {}", terminal, next);
        }
    }
}

#[test]
fn status_serializes_lowercase() {
    assert_eq!(serde_json::to_value(CallStatus::Ringing).unwrap(), json!("ringing"));
    assert_eq!(
        serde_json::from_value::<CallStatus>(json!("missed")).unwrap(),
        CallStatus::Missed
    );
}

#[test]
fn guard_applies_forward_transitions() {
    let guard = TransitionGuard::new();
    guard.track("c1", CallStatus::Ringing);
    assert_eq!(
        guard.try_apply("c1", CallStatus::Answered),
        TransitionOutcome::Applied
    );
    assert_eq!(
        guard.try_apply("c1", CallStatus::Ended),
        TransitionOutcome::Applied
    );
    assert_eq!(guard.current("c1"), Some(CallStatus::Ended));
}

#[test]
fn guard_ignores_duplicate_notifications() {
    let guard = TransitionGuard::new();
    guard.track("c1", CallStatus::Ringing);
    assert_eq!(
        guard.try_apply("c1", CallStatus::Declined),
        TransitionOutcome::Applied
    );
    // re-delivered terminal notification must not re-fire
    assert_eq!(
        guard.try_apply("c1", CallStatus::Declined),
        TransitionOutcome::Duplicate
    );
    assert_eq!(guard.current("c1"), Some(CallStatus::Declined));
}

#[test]
fn guard_rejects_backward_transitions_without_state_change() {
    let guard = TransitionGuard::new();
    guard.track("c1", CallStatus::Ringing);
    guard.try_apply("c1", CallStatus::Ended);
    assert_eq!(
        guard.try_apply("c1", CallStatus::Ringing),
        TransitionOutcome::Rejected
    );
    assert_eq!(
        guard.try_apply("c1", CallStatus::Answered),
        TransitionOutcome::Rejected
    );
    assert_eq!(guard.current("c1"), Some(CallStatus::Ended));
}

#[test]
fn guard_tracks_first_observation_of_unknown_call() {
    let guard = TransitionGuard::new();
    assert_eq!(
        guard.try_apply("fresh", CallStatus::Ringing),
        TransitionOutcome::Applied
    );
    assert_eq!(guard.current("fresh"), Some(CallStatus::Ringing));
}

fn session_created_at(created_at: u64) -> CallSession {
    CallSession {
        id: "c1".to_string(),
        conversation_id: "conv".to_string(),
        caller_id: "alice".to_string(),
        callee_id: "bob".to_string(),
        caller_name: "Alice".to_string(),
        status: CallStatus::Ringing,
        created_at,
        answered_at: None,
        ended_at: None,
        duration: None,
        offer: None,
        answer: None,
    }
}

#[test]
fn staleness_window_is_exclusive_of_fresh_records() {
    let now = 1_000_000;
    let window = 120_000;
    assert!(!session_created_at(now).is_stale(now, window));
    assert!(!session_created_at(now - 120_000).is_stale(now, window));
    assert!(session_created_at(now - 120_001).is_stale(now, window));
    // clock skew: records from the future are not stale
    assert!(!session_created_at(now + 5_000).is_stale(now, window));
}

#[test]
fn record_serializes_camel_case_without_absent_fields() {
    let session = session_created_at(42);
    let value = serde_json::to_value(&session).unwrap();
    assert_eq!(value["callerId"], json!("alice"));
    assert_eq!(value["createdAt"], json!(42));
    assert_eq!(value["status"], json!("ringing"));
    assert!(value.get("answeredAt").is_none());
    assert!(value.get("duration").is_none());
}
