use super::negotiate::NegotiationDriver;
use super::timeout::RingTimer;
use super::{paths, CallSession, CallStatus, TransitionGuard, TransitionOutcome};
use crate::config::SignalingConfig;
use crate::error::CallError;
use crate::event::{CallEvent, EndReason, EventSender};
use crate::media::{MediaEngineEvent, MediaEventReceiver};
use crate::store::{SignalingStore, StoreUpdate, Subscription};
use crate::{get_timestamp, CallId, UserId};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::select;
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type ActiveCallRef = Arc<ActiveCall>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

/// Channels the session loop multiplexes. All subscriptions target the
/// local user's namespace; the remote side mirrors its writes there.
pub struct ServeChannels {
    pub status_sub: Subscription,
    pub answer_sub: Subscription,
    pub candidate_sub: Subscription,
    pub media_events: MediaEventReceiver,
    pub timer_rx: UnboundedReceiver<()>,
}

/// One locally active call session: the authoritative local view of the
/// mirrored record, the negotiation driver, the ring timer and the serve
/// loop that reacts to store notifications and media engine events.
pub struct ActiveCall {
    pub call_id: CallId,
    pub role: CallRole,
    pub session: RwLock<CallSession>,
    pub cancel_token: CancellationToken,
    driver: NegotiationDriver,
    store: Arc<dyn SignalingStore>,
    guard: Arc<TransitionGuard>,
    event_sender: EventSender,
    config: SignalingConfig,
    local_user: UserId,
    remote_user: UserId,
    ring_timer: Mutex<Option<RingTimer>>,
    candidate_seq: AtomicU64,
    cleaned: AtomicBool,
    active_slot: Arc<Mutex<Option<ActiveCallRef>>>,
}

impl ActiveCall {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        role: CallRole,
        session: CallSession,
        local_user: UserId,
        driver: NegotiationDriver,
        store: Arc<dyn SignalingStore>,
        guard: Arc<TransitionGuard>,
        event_sender: EventSender,
        config: SignalingConfig,
        cancel_token: CancellationToken,
        active_slot: Arc<Mutex<Option<ActiveCallRef>>>,
    ) -> Self {
        let remote_user = session.remote_user(&local_user).to_string();
        Self {
            call_id: session.id.clone(),
            role,
            session: RwLock::new(session),
            cancel_token,
            driver,
            store,
            guard,
            event_sender,
            config,
            local_user,
            remote_user,
            ring_timer: Mutex::new(None),
            candidate_seq: AtomicU64::new(0),
            cleaned: AtomicBool::new(false),
            active_slot,
        }
    }

    pub fn snapshot(&self) -> CallSession {
        self.session.read().unwrap().clone()
    }

    pub(crate) fn driver(&self) -> &NegotiationDriver {
        &self.driver
    }

    pub(crate) fn arm_ring_timer(&self, timer: RingTimer) {
        *self.ring_timer.lock().unwrap() = Some(timer);
    }

    fn cancel_ring_timer(&self) {
        if let Some(timer) = self.ring_timer.lock().unwrap().take() {
            timer.cancel();
        }
    }

    fn emit(&self, event: CallEvent) {
        self.event_sender.send(event).ok();
    }

    /// Write one field under both participants' namespaces. The two writes
    /// are independently observable; there is no cross-namespace atomicity.
    pub(crate) async fn write_both(
        &self,
        path_for: impl Fn(&str) -> String,
        value: Value,
    ) -> Result<(), CallError> {
        for owner in [self.local_user.as_str(), self.remote_user.as_str()] {
            let path = path_for(owner);
            self.store
                .write(&path, value.clone())
                .await
                .map_err(|source| CallError::SignalingWrite { path, source })?;
        }
        Ok(())
    }

    /// Publish a locally discovered candidate under the remote user's
    /// namespace. The zero-padded sequence key makes key-order replay equal
    /// generation order on the receiving side.
    async fn publish_local_candidate(&self, candidate: Value) {
        let seq = self.candidate_seq.fetch_add(1, Ordering::SeqCst);
        let key = format!("{:08}", seq);
        let path = paths::candidate(&self.remote_user, &self.call_id, &key);
        if let Err(e) = self.store.write(&path, candidate).await {
            warn!(call_id = self.call_id, path, "failed to publish candidate: {}", e);
        }
    }

    pub(crate) async fn publish_local_candidates(&self, candidates: Vec<Value>) {
        for candidate in candidates {
            self.publish_local_candidate(candidate).await;
        }
    }

    async fn read_u64(&self, path: &str) -> Option<u64> {
        self.store
            .read_once(path)
            .await
            .ok()
            .flatten()
            .and_then(|v| v.as_u64())
    }

    /// Local hangup, remote-initiated end and transport failure all route
    /// through here. Idempotent: a second invocation observes the guard's
    /// `Duplicate` and returns the unchanged snapshot.
    pub async fn hangup(&self, reason: EndReason) -> Result<CallSession, CallError> {
        match self.guard.try_apply(&self.call_id, CallStatus::Ended) {
            TransitionOutcome::Applied => {}
            TransitionOutcome::Duplicate | TransitionOutcome::Rejected => {
                return Ok(self.snapshot());
            }
        }
        // cancellation must happen before the terminal write so an expired
        // timer can no longer race a `missed` in behind it
        self.cancel_ring_timer();

        let now = get_timestamp();
        let duration = {
            let mut session = self.session.write().unwrap();
            session.status = CallStatus::Ended;
            session.ended_at = Some(now);
            let duration = session
                .answered_at
                .map(|answered_at| now.saturating_sub(answered_at) / 1000)
                .unwrap_or(0);
            session.duration = Some(duration);
            duration
        };
        info!(call_id = self.call_id, duration, ?reason, "call ended");

        let call_id = self.call_id.clone();
        let result = async {
            self.write_both(|owner| paths::ended_at(owner, &call_id), json!(now))
                .await?;
            self.write_both(|owner| paths::duration(owner, &call_id), json!(duration))
                .await?;
            self.write_both(|owner| paths::status(owner, &call_id), json!("ended"))
                .await
        }
        .await;

        self.emit(CallEvent::Ended {
            call_id: self.call_id.clone(),
            reason,
            duration,
            timestamp: now,
        });
        self.cleanup().await;
        result?;
        Ok(self.snapshot())
    }

    /// Ring window expired. Only resolves to `missed` when the call is
    /// still ringing; any earlier transition wins.
    async fn on_ring_timeout(&self) {
        match self.guard.try_apply(&self.call_id, CallStatus::Missed) {
            TransitionOutcome::Applied => {}
            TransitionOutcome::Duplicate | TransitionOutcome::Rejected => {
                debug!(call_id = self.call_id, "ring timeout after resolution, ignored");
                return;
            }
        }
        let now = get_timestamp();
        {
            let mut session = self.session.write().unwrap();
            session.status = CallStatus::Missed;
            session.ended_at = Some(now);
        }
        info!(call_id = self.call_id, "call missed after ring timeout");

        let call_id = self.call_id.clone();
        if let Err(e) = self
            .write_both(|owner| paths::ended_at(owner, &call_id), json!(now))
            .await
        {
            warn!(call_id = self.call_id, "failed to write endedAt: {}", e);
        }
        if let Err(e) = self
            .write_both(|owner| paths::status(owner, &call_id), json!("missed"))
            .await
        {
            warn!(call_id = self.call_id, "failed to write missed status: {}", e);
        }
        self.emit(CallEvent::Missed {
            call_id: self.call_id.clone(),
            timestamp: now,
        });
        self.cleanup().await;
    }

    /// A status notification landed on the local mirror. The guard filters
    /// our own echoes, duplicates and table violations before anything
    /// user-visible fires.
    async fn handle_status_update(&self, update: StoreUpdate) {
        let status: CallStatus = match serde_json::from_value(update.value.clone()) {
            Ok(status) => status,
            Err(_) => {
                if !update.value.is_null() {
                    warn!(call_id = self.call_id, value = %update.value, "unparseable status");
                }
                return;
            }
        };
        match self.guard.try_apply(&self.call_id, status) {
            TransitionOutcome::Applied => {}
            TransitionOutcome::Duplicate | TransitionOutcome::Rejected => return,
        }
        let now = get_timestamp();
        match status {
            CallStatus::Ringing => {}
            CallStatus::Answered => {
                self.cancel_ring_timer();
                let answered_at = self
                    .read_u64(&paths::answered_at(&self.local_user, &self.call_id))
                    .await
                    .unwrap_or(now);
                {
                    let mut session = self.session.write().unwrap();
                    session.status = CallStatus::Answered;
                    session.answered_at = Some(answered_at);
                }
                info!(call_id = self.call_id, "call answered by remote");
                self.emit(CallEvent::Answered {
                    call_id: self.call_id.clone(),
                    answered_at,
                    timestamp: now,
                });
            }
            CallStatus::Declined => {
                self.cancel_ring_timer();
                {
                    let mut session = self.session.write().unwrap();
                    session.status = CallStatus::Declined;
                    session.ended_at = Some(now);
                }
                info!(call_id = self.call_id, "call declined by remote");
                self.emit(CallEvent::Declined {
                    call_id: self.call_id.clone(),
                    timestamp: now,
                });
                self.cleanup().await;
            }
            CallStatus::Missed => {
                self.cancel_ring_timer();
                {
                    let mut session = self.session.write().unwrap();
                    session.status = CallStatus::Missed;
                    session.ended_at = Some(now);
                }
                self.emit(CallEvent::Missed {
                    call_id: self.call_id.clone(),
                    timestamp: now,
                });
                self.cleanup().await;
            }
            CallStatus::Ended => {
                self.cancel_ring_timer();
                let duration = self
                    .read_u64(&paths::duration(&self.local_user, &self.call_id))
                    .await
                    .unwrap_or(0);
                {
                    let mut session = self.session.write().unwrap();
                    session.status = CallStatus::Ended;
                    session.ended_at = Some(now);
                    session.duration = Some(duration);
                }
                info!(call_id = self.call_id, duration, "call ended by remote");
                self.emit(CallEvent::Ended {
                    call_id: self.call_id.clone(),
                    reason: EndReason::RemoteHangup,
                    duration,
                    timestamp: now,
                });
                self.cleanup().await;
            }
        }
    }

    /// The callee's answer landed on the caller's mirror: install it and
    /// publish every candidate queued while it was pending.
    async fn handle_answer_update(&self, update: StoreUpdate) {
        if self.role != CallRole::Caller {
            return;
        }
        let answer = match update.value.as_str() {
            Some(answer) => answer.to_string(),
            None => return,
        };
        if self.session.read().unwrap().answer.is_some() {
            debug!(call_id = self.call_id, "answer already installed, ignored");
            return;
        }
        self.session.write().unwrap().answer = Some(answer.clone());
        match self.driver.accept_answer(&answer).await {
            Ok(to_publish) => {
                self.publish_local_candidates(to_publish).await;
            }
            Err(e) => {
                warn!(call_id = self.call_id, "failed to install remote answer: {}", e);
                self.emit(CallEvent::Error {
                    call_id: Some(self.call_id.clone()),
                    message: format!("remote answer rejected: {}", e),
                    timestamp: get_timestamp(),
                });
            }
        }
    }

    async fn handle_candidate_update(&self, update: StoreUpdate) {
        if update.value.is_null() {
            return;
        }
        if let Err(e) = self.driver.on_remote_candidate(update.value).await {
            warn!(call_id = self.call_id, "failed to add remote candidate: {}", e);
        }
    }

    async fn handle_media_event(&self, event: MediaEngineEvent) {
        match event {
            MediaEngineEvent::LocalCandidate(candidate) => {
                match self.driver.on_local_candidate(candidate) {
                    Some(candidate) => self.publish_local_candidate(candidate).await,
                    None => {
                        debug!(call_id = self.call_id, "local candidate queued");
                    }
                }
            }
            MediaEngineEvent::TransportStateChange(state) => {
                let answered = self.guard.current(&self.call_id) == Some(CallStatus::Answered);
                if state.is_broken() && answered {
                    warn!(call_id = self.call_id, ?state, "transport failed, hanging up");
                    if let Err(e) = self.hangup(EndReason::TransportFailure).await {
                        warn!(call_id = self.call_id, "transport-failure hangup: {}", e);
                    }
                } else {
                    debug!(call_id = self.call_id, ?state, "transport state");
                }
            }
        }
    }

    /// The per-session event loop. Everything that can suspend happens
    /// here or in spawned writes; notifications keep flowing while earlier
    /// ones are being handled because the store buffers per subscription.
    pub async fn serve(self: &Arc<Self>, channels: ServeChannels) {
        let ServeChannels {
            mut status_sub,
            mut answer_sub,
            mut candidate_sub,
            mut media_events,
            mut timer_rx,
        } = channels;
        let mut media_open = true;
        loop {
            select! {
                _ = self.cancel_token.cancelled() => {
                    debug!(call_id = self.call_id, "session loop cancelled");
                    break;
                }
                Some(update) = status_sub.receiver.recv() => {
                    self.handle_status_update(update).await;
                }
                Some(update) = answer_sub.receiver.recv() => {
                    self.handle_answer_update(update).await;
                }
                Some(update) = candidate_sub.receiver.recv() => {
                    self.handle_candidate_update(update).await;
                }
                Some(_) = timer_rx.recv() => {
                    self.on_ring_timeout().await;
                }
                event = media_events.recv(), if media_open => {
                    match event {
                        Ok(event) => self.handle_media_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(call_id = self.call_id, skipped, "media events lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            media_open = false;
                        }
                    }
                }
            }
        }
        self.cleanup().await;
    }

    /// Release everything this session holds. Safe to invoke multiple
    /// times; terminal triggers can race and each path calls in here.
    pub async fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(call_id = self.call_id, "cleaning up session resources");
        self.cancel_ring_timer();
        if let Err(e) = self.driver.engine().close().await {
            warn!(call_id = self.call_id, "media engine close: {}", e);
        }
        self.driver.reset();
        // ends the serve loop; dropped subscriptions unsubscribe themselves
        self.cancel_token.cancel();
        let mut slot = self.active_slot.lock().unwrap();
        if slot.as_ref().map(|c| c.call_id == self.call_id).unwrap_or(false) {
            slot.take();
        }
    }
}
