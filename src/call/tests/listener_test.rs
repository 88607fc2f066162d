use super::{fast_config, settle, test_client, wait_for_event};
use crate::call::paths;
use crate::config::SignalingConfig;
use crate::event::{CallEvent, EventReceiver};
use crate::fixtures::FakeMediaEngine;
use crate::get_timestamp;
use crate::store::{MemoryStore, SignalingStore};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn ringing_record(call_id: &str, caller: &str, callee: &str, created_at: u64) -> Value {
    json!({
        "id": call_id,
        "conversationId": "conv-1",
        "callerId": caller,
        "calleeId": callee,
        "callerName": caller,
        "status": "ringing",
        "createdAt": created_at,
        "offer": format!("v=0 offer from {}", caller),
    })
}

async fn no_incoming_within(events: &mut EventReceiver, window: Duration) -> bool {
    timeout(window, async {
        loop {
            if let Ok(CallEvent::Incoming { .. }) = events.recv().await {
                return;
            }
        }
    })
    .await
    .is_err()
}

#[tokio::test]
async fn pending_check_skips_stale_ghost_records() {
    let store = MemoryStore::new();
    let engine = Arc::new(FakeMediaEngine::new("bob"));
    let bob = test_client(&store, "bob", engine, SignalingConfig::default());
    let mut events = bob.subscribe_events();

    let now = get_timestamp();
    store
        .write(
            &paths::call_root("bob", "c-fresh"),
            ringing_record("c-fresh", "alice", "bob", now),
        )
        .await
        .unwrap();
    // left behind by a crashed caller, well past the staleness window
    store
        .write(
            &paths::call_root("bob", "c-stale"),
            ringing_record("c-stale", "carol", "bob", now - 130_000),
        )
        .await
        .unwrap();

    assert!(bob.check_for_pending_calls().await.unwrap());
    let event = wait_for_event(&mut events, |e| matches!(e, CallEvent::Incoming { .. }))
        .await
        .unwrap();
    assert_eq!(event.call_id(), Some("c-fresh"));
    assert!(no_incoming_within(&mut events, Duration::from_millis(300)).await);
}

#[tokio::test]
async fn pending_check_reports_nothing_on_a_quiet_namespace() {
    let store = MemoryStore::new();
    let engine = Arc::new(FakeMediaEngine::new("bob"));
    let bob = test_client(&store, "bob", engine, SignalingConfig::default());

    assert!(!bob.check_for_pending_calls().await.unwrap());

    // a resolved record is not a pending call either
    let mut record = ringing_record("c-old", "alice", "bob", get_timestamp());
    record["status"] = json!("ended");
    store
        .write(&paths::call_root("bob", "c-old"), record)
        .await
        .unwrap();
    assert!(!bob.check_for_pending_calls().await.unwrap());
}

#[tokio::test]
async fn pending_check_surfaces_each_call_once() {
    let store = MemoryStore::new();
    let engine = Arc::new(FakeMediaEngine::new("bob"));
    let bob = test_client(&store, "bob", engine, SignalingConfig::default());
    let mut events = bob.subscribe_events();

    store
        .write(
            &paths::call_root("bob", "c-1"),
            ringing_record("c-1", "alice", "bob", get_timestamp()),
        )
        .await
        .unwrap();

    assert!(bob.check_for_pending_calls().await.unwrap());
    assert!(bob.check_for_pending_calls().await.unwrap());

    wait_for_event(&mut events, |e| matches!(e, CallEvent::Incoming { .. }))
        .await
        .unwrap();
    assert!(no_incoming_within(&mut events, Duration::from_millis(300)).await);
}

#[tokio::test]
async fn listener_surfaces_a_new_ring() {
    let store = MemoryStore::new();
    let alice_engine = Arc::new(FakeMediaEngine::new("alice"));
    let bob_engine = Arc::new(FakeMediaEngine::new("bob"));
    let alice = test_client(&store, "alice", alice_engine, SignalingConfig::default());
    let bob = test_client(&store, "bob", bob_engine, SignalingConfig::default());
    let mut bob_events = bob.subscribe_events();

    let _listener = bob.start_listening().await.unwrap();
    let session = alice
        .start_call("conv-1".to_string(), "bob".to_string())
        .await
        .unwrap();

    let event = wait_for_event(&mut bob_events, |e| matches!(e, CallEvent::Incoming { .. }))
        .await
        .unwrap();
    assert_eq!(event.call_id(), Some(session.id.as_str()));
    match event {
        CallEvent::Incoming { call, .. } => {
            assert_eq!(call.caller_id, "alice");
            assert_eq!(call.caller_name, "alice display");
            assert!(call.offer.is_some());
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn unanswered_ring_is_dismissed_when_the_caller_times_out() {
    let store = MemoryStore::new();
    let alice_engine = Arc::new(FakeMediaEngine::new("alice"));
    let bob_engine = Arc::new(FakeMediaEngine::new("bob"));
    // one-second ring window on the caller, default on the callee
    let alice = test_client(&store, "alice", alice_engine, fast_config());
    let bob = test_client(&store, "bob", bob_engine, SignalingConfig::default());
    let mut bob_events = bob.subscribe_events();

    let session = alice
        .start_call("conv-1".to_string(), "bob".to_string())
        .await
        .unwrap();
    assert!(bob.check_for_pending_calls().await.unwrap());
    wait_for_event(&mut bob_events, |e| matches!(e, CallEvent::Incoming { .. }))
        .await
        .unwrap();

    let event = wait_for_event(&mut bob_events, |e| matches!(e, CallEvent::Missed { .. }))
        .await
        .unwrap();
    assert_eq!(event.call_id(), Some(session.id.as_str()));
}

#[tokio::test]
async fn second_incoming_call_is_declined_while_busy() {
    let store = MemoryStore::new();
    let alice_engine = Arc::new(FakeMediaEngine::new("alice"));
    let bob_engine = Arc::new(FakeMediaEngine::new("bob"));
    let carol_engine = Arc::new(FakeMediaEngine::new("carol"));
    let alice = test_client(&store, "alice", alice_engine, SignalingConfig::default());
    let bob = test_client(&store, "bob", bob_engine, SignalingConfig::default());
    let carol = test_client(&store, "carol", carol_engine, SignalingConfig::default());
    let mut alice_events = alice.subscribe_events();
    let mut bob_events = bob.subscribe_events();
    let mut carol_events = carol.subscribe_events();

    let _listener = bob.start_listening().await.unwrap();
    alice
        .start_call("conv-1".to_string(), "bob".to_string())
        .await
        .unwrap();
    let incoming = match wait_for_event(&mut bob_events, |e| {
        matches!(e, CallEvent::Incoming { .. })
    })
    .await
    .unwrap()
    {
        CallEvent::Incoming { call, .. } => call,
        other => panic!("unexpected event: {:?}", other),
    };
    bob.answer_call(&incoming).await.unwrap();
    wait_for_event(&mut alice_events, |e| matches!(e, CallEvent::Answered { .. }))
        .await
        .unwrap();

    let second = carol
        .start_call("conv-2".to_string(), "bob".to_string())
        .await
        .unwrap();
    let event = wait_for_event(&mut carol_events, |e| matches!(e, CallEvent::Declined { .. }))
        .await
        .unwrap();
    assert_eq!(event.call_id(), Some(second.id.as_str()));

    // bob's application never sees the busy call
    assert!(no_incoming_within(&mut bob_events, Duration::from_millis(300)).await);
    for owner in ["bob", "carol"] {
        let status = store
            .read_once(&paths::status(owner, &second.id))
            .await
            .unwrap();
        assert_eq!(status, Some(json!("declined")), "{} mirror", owner);
    }
}

#[tokio::test]
async fn pending_check_declines_a_second_call_while_busy() {
    let store = MemoryStore::new();
    let alice_engine = Arc::new(FakeMediaEngine::new("alice"));
    let bob_engine = Arc::new(FakeMediaEngine::new("bob"));
    let carol_engine = Arc::new(FakeMediaEngine::new("carol"));
    let alice = test_client(&store, "alice", alice_engine, SignalingConfig::default());
    let bob = test_client(&store, "bob", bob_engine, SignalingConfig::default());
    let carol = test_client(&store, "carol", carol_engine, SignalingConfig::default());
    let mut alice_events = alice.subscribe_events();
    let mut bob_events = bob.subscribe_events();
    let mut carol_events = carol.subscribe_events();

    // bob polls rather than listening; get him on a call with alice first
    alice
        .start_call("conv-1".to_string(), "bob".to_string())
        .await
        .unwrap();
    assert!(bob.check_for_pending_calls().await.unwrap());
    let incoming = match wait_for_event(&mut bob_events, |e| {
        matches!(e, CallEvent::Incoming { .. })
    })
    .await
    .unwrap()
    {
        CallEvent::Incoming { call, .. } => call,
        other => panic!("unexpected event: {:?}", other),
    };
    bob.answer_call(&incoming).await.unwrap();
    wait_for_event(&mut alice_events, |e| matches!(e, CallEvent::Answered { .. }))
        .await
        .unwrap();

    let second = carol
        .start_call("conv-2".to_string(), "bob".to_string())
        .await
        .unwrap();
    // nothing pending from bob's point of view; the busy call resolves
    assert!(!bob.check_for_pending_calls().await.unwrap());
    let event = wait_for_event(&mut carol_events, |e| matches!(e, CallEvent::Declined { .. }))
        .await
        .unwrap();
    assert_eq!(event.call_id(), Some(second.id.as_str()));
    assert!(no_incoming_within(&mut bob_events, Duration::from_millis(300)).await);
    for owner in ["bob", "carol"] {
        let status = store
            .read_once(&paths::status(owner, &second.id))
            .await
            .unwrap();
        assert_eq!(status, Some(json!("declined")), "{} mirror", owner);
    }
}

#[tokio::test]
async fn stopped_listener_goes_quiet() {
    let store = MemoryStore::new();
    let alice_engine = Arc::new(FakeMediaEngine::new("alice"));
    let bob_engine = Arc::new(FakeMediaEngine::new("bob"));
    let alice = test_client(&store, "alice", alice_engine, SignalingConfig::default());
    let bob = test_client(&store, "bob", bob_engine, SignalingConfig::default());
    let mut bob_events = bob.subscribe_events();

    let listener = bob.start_listening().await.unwrap();
    listener.stop();
    settle().await;

    alice
        .start_call("conv-1".to_string(), "bob".to_string())
        .await
        .unwrap();
    assert!(no_incoming_within(&mut bob_events, Duration::from_millis(300)).await);
}
