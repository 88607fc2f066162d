use super::negotiate::NegotiationDriver;
use super::session::{ActiveCall, ActiveCallRef, CallRole, ServeChannels};
use super::timeout::RingTimer;
use super::{paths, CallSession, CallStatus, TransitionGuard, TransitionOutcome};
use crate::config::SignalingConfig;
use crate::error::{CallError, StoreError};
use crate::event::{CallEvent, EndReason, EventReceiver, EventSender};
use crate::media::{MediaEngine, MediaEventReceiver};
use crate::notify::{dispatch_notification, CallNotification, CallNotifier, NoopNotifier};
use crate::store::SignalingStore;
use crate::{get_timestamp, ConversationId, UserId};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::select;
use tokio::sync::mpsc::unbounded_channel;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct CallClientBuilder {
    user_id: UserId,
    display_name: Option<String>,
    config: SignalingConfig,
    store: Option<Arc<dyn SignalingStore>>,
    engine: Option<Arc<dyn MediaEngine>>,
    notifier: Option<Arc<dyn CallNotifier>>,
    cancel_token: Option<CancellationToken>,
}

impl CallClientBuilder {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
            config: SignalingConfig::default(),
            store: None,
            engine: None,
            notifier: None,
            cancel_token: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_config(mut self, config: SignalingConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SignalingStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_media_engine(mut self, engine: Arc<dyn MediaEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn CallNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn build(self) -> anyhow::Result<CallClient> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("a signaling store is required"))?;
        let engine = self
            .engine
            .ok_or_else(|| anyhow::anyhow!("a media engine is required"))?;
        let (event_sender, _) = tokio::sync::broadcast::channel(self.config.event_channel_size);
        Ok(CallClient {
            inner: Arc::new(ClientInner {
                display_name: self.display_name.unwrap_or_else(|| self.user_id.clone()),
                user_id: self.user_id,
                config: self.config,
                store,
                engine,
                notifier: self.notifier.unwrap_or_else(|| Arc::new(NoopNotifier)),
                guard: Arc::new(TransitionGuard::new()),
                token: self.cancel_token.unwrap_or_default(),
                event_sender,
                active: Arc::new(Mutex::new(None)),
            }),
        })
    }
}

struct ClientInner {
    user_id: UserId,
    display_name: String,
    config: SignalingConfig,
    store: Arc<dyn SignalingStore>,
    engine: Arc<dyn MediaEngine>,
    notifier: Arc<dyn CallNotifier>,
    guard: Arc<TransitionGuard>,
    token: CancellationToken,
    event_sender: EventSender,
    active: Arc<Mutex<Option<ActiveCallRef>>>,
}

/// Handle returned by `start_listening`; dropping it (or calling `stop`)
/// unsubscribes the continuous incoming-call watch.
pub struct CallListener {
    token: CancellationToken,
}

impl CallListener {
    pub fn stop(&self) {
        self.token.cancel();
    }
}

impl Drop for CallListener {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Per-user entry point to the signaling core. One locally active call
/// session at a time; lifecycle notifications go out on a broadcast
/// channel obtained via `subscribe_events`.
#[derive(Clone)]
pub struct CallClient {
    inner: Arc<ClientInner>,
}

impl CallClient {
    pub fn builder(user_id: impl Into<UserId>) -> CallClientBuilder {
        CallClientBuilder::new(user_id)
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn subscribe_events(&self) -> EventReceiver {
        self.inner.event_sender.subscribe()
    }

    pub fn active_call(&self) -> Option<ActiveCallRef> {
        self.inner.active.lock().unwrap().clone()
    }

    /// Stop the client: cancels the listener and any active session loop
    /// (which runs its cleanup on the way out).
    pub fn stop(&self) {
        info!(user_id = self.inner.user_id, "stopping call client");
        self.inner.token.cancel();
    }

    fn emit(&self, event: CallEvent) {
        self.inner.event_sender.send(event).ok();
    }

    async fn write_mirrored(
        &self,
        session: &CallSession,
        path_for: impl Fn(&str) -> String,
        value: Value,
    ) -> Result<(), CallError> {
        let remote = session.remote_user(&self.inner.user_id);
        for owner in [self.inner.user_id.as_str(), remote] {
            let path = path_for(owner);
            self.inner
                .store
                .write(&path, value.clone())
                .await
                .map_err(|source| CallError::SignalingWrite { path, source })?;
        }
        Ok(())
    }

    /// Open the store subscriptions a session loop multiplexes. Called
    /// after the transition's writes so the immediately replayed status is
    /// a silent duplicate for the guard.
    async fn open_channels(
        &self,
        call_id: &str,
        timer_rx: tokio::sync::mpsc::UnboundedReceiver<()>,
        media_events: MediaEventReceiver,
    ) -> Result<ServeChannels, CallError> {
        let me = self.inner.user_id.as_str();
        let subscribe_err = |path: String| {
            move |source: StoreError| CallError::SignalingWrite { path, source }
        };
        let status_path = paths::status(me, call_id);
        let status_sub = self
            .inner
            .store
            .subscribe_value(&status_path)
            .await
            .map_err(subscribe_err(status_path.clone()))?;
        let answer_path = paths::answer(me, call_id);
        let answer_sub = self
            .inner
            .store
            .subscribe_value(&answer_path)
            .await
            .map_err(subscribe_err(answer_path.clone()))?;
        let candidates_path = paths::candidates(me, call_id);
        let candidate_sub = self
            .inner
            .store
            .subscribe_child_added(&candidates_path)
            .await
            .map_err(subscribe_err(candidates_path.clone()))?;
        Ok(ServeChannels {
            status_sub,
            answer_sub,
            candidate_sub,
            media_events,
            timer_rx,
        })
    }

    fn make_active(&self, role: CallRole, session: CallSession) -> ActiveCallRef {
        Arc::new(ActiveCall::new(
            role,
            session,
            self.inner.user_id.clone(),
            NegotiationDriver::new(self.inner.engine.clone()),
            self.inner.store.clone(),
            self.inner.guard.clone(),
            self.inner.event_sender.clone(),
            self.inner.config.clone(),
            self.inner.token.child_token(),
            self.inner.active.clone(),
        ))
    }

    fn spawn_serve(&self, active: ActiveCallRef, channels: ServeChannels) {
        tokio::spawn(async move {
            active.serve(channels).await;
        });
    }

    /// Initiate an outgoing call. Media acquisition happens before any
    /// signaling write; on `MediaUnavailable` no record exists anywhere.
    pub async fn start_call(
        &self,
        conversation_id: ConversationId,
        callee_id: UserId,
    ) -> Result<CallSession, CallError> {
        let call_id = Uuid::new_v4().to_string();
        let active = self.make_active(
            CallRole::Caller,
            CallSession {
                id: call_id.clone(),
                conversation_id,
                caller_id: self.inner.user_id.clone(),
                callee_id: callee_id.clone(),
                caller_name: self.inner.display_name.clone(),
                status: CallStatus::Ringing,
                created_at: get_timestamp(),
                answered_at: None,
                ended_at: None,
                duration: None,
                offer: None,
                answer: None,
            },
        );
        // claim the slot before the first await; a concurrent start must
        // not pass the busy check while this one is still acquiring media
        {
            let mut slot = self.inner.active.lock().unwrap();
            if slot.is_some() {
                return Err(CallError::CallInProgress);
            }
            *slot = Some(active.clone());
        }

        if let Err(e) = self.inner.engine.acquire_local_capability().await {
            active.cleanup().await;
            return Err(CallError::MediaUnavailable(e.to_string()));
        }
        // the receiver must exist before negotiation starts: candidates
        // trickled while the offer is produced stay buffered until the
        // session loop picks them up
        let media_events = self.inner.engine.subscribe();

        let offer = match active.driver().start_outgoing().await {
            Ok(offer) => offer,
            Err(e) => {
                active.cleanup().await;
                return Err(CallError::MediaUnavailable(format!(
                    "offer negotiation failed: {}",
                    e
                )));
            }
        };
        let session = {
            let mut session = active.session.write().unwrap();
            session.offer = Some(offer);
            session.clone()
        };
        self.inner.guard.track(&call_id, CallStatus::Ringing);

        let record = match serde_json::to_value(&session) {
            Ok(record) => record,
            Err(e) => {
                active.cleanup().await;
                return Err(CallError::SignalingWrite {
                    path: paths::call_root(&self.inner.user_id, &call_id),
                    source: StoreError::Serialization(e),
                });
            }
        };
        if let Err(e) = self
            .write_mirrored(&session, |owner| paths::call_root(owner, &call_id), record)
            .await
        {
            active.cleanup().await;
            return Err(e);
        }

        let (timer_tx, timer_rx) = unbounded_channel();
        let channels = match self.open_channels(&call_id, timer_rx, media_events).await {
            Ok(channels) => channels,
            Err(e) => {
                active.cleanup().await;
                return Err(e);
            }
        };
        active.arm_ring_timer(RingTimer::start(
            call_id.clone(),
            self.inner.config.ring_timeout(),
            timer_tx,
        ));
        self.spawn_serve(active, channels);

        info!(
            call_id,
            callee_id,
            user_id = self.inner.user_id,
            "outgoing call started"
        );
        // best-effort push; failure is logged inside the dispatcher and
        // never fails the call
        dispatch_notification(
            self.inner.notifier.clone(),
            self.inner.token.child_token(),
            callee_id,
            CallNotification {
                title: "Incoming call".to_string(),
                body: format!("{} is calling", self.inner.display_name),
                call_id: call_id.clone(),
                caller_name: self.inner.display_name.clone(),
            },
        );
        Ok(session)
    }

    /// Accept a surfaced incoming call: acquire media, consume the pending
    /// offer, produce and mirror the answer, drain queued candidates.
    pub async fn answer_call(&self, incoming: &CallSession) -> Result<(), CallError> {
        let current = self
            .inner
            .guard
            .current(&incoming.id)
            .unwrap_or(incoming.status);
        if current != CallStatus::Ringing {
            return Err(CallError::InvalidState {
                op: "answer",
                status: current,
            });
        }
        let active = self.make_active(CallRole::Callee, incoming.clone());
        // claim the slot before the first await, as in start_call
        {
            let mut slot = self.inner.active.lock().unwrap();
            if let Some(existing) = slot.as_ref() {
                if existing.call_id == incoming.id {
                    return Err(CallError::InvalidState {
                        op: "answer",
                        status: existing.snapshot().status,
                    });
                }
                return Err(CallError::CallInProgress);
            }
            *slot = Some(active.clone());
        }

        let offer = match &incoming.offer {
            Some(offer) => offer.clone(),
            None => {
                let path = paths::offer(&self.inner.user_id, &incoming.id);
                let read = self.inner.store.read_once(&path).await;
                match read {
                    Ok(value) => match value.and_then(|v| v.as_str().map(|s| s.to_string())) {
                        Some(offer) => offer,
                        None => {
                            active.cleanup().await;
                            return Err(CallError::InvalidState {
                                op: "answer",
                                status: current,
                            });
                        }
                    },
                    Err(source) => {
                        active.cleanup().await;
                        return Err(CallError::SignalingWrite { path, source });
                    }
                }
            }
        };

        if let Err(e) = self.inner.engine.acquire_local_capability().await {
            active.cleanup().await;
            return Err(CallError::MediaUnavailable(e.to_string()));
        }
        // subscribe before negotiation so candidates trickled while the
        // answer is produced are buffered for the session loop
        let media_events = self.inner.engine.subscribe();

        let (answer, to_publish) = match active.driver().start_incoming(&offer).await {
            Ok(result) => result,
            Err(e) => {
                active.cleanup().await;
                return Err(CallError::MediaUnavailable(format!(
                    "answer negotiation failed: {}",
                    e
                )));
            }
        };

        match self.inner.guard.try_apply(&incoming.id, CallStatus::Answered) {
            TransitionOutcome::Applied => {}
            TransitionOutcome::Duplicate | TransitionOutcome::Rejected => {
                let status = self
                    .inner
                    .guard
                    .current(&incoming.id)
                    .unwrap_or(incoming.status);
                active.cleanup().await;
                return Err(CallError::InvalidState {
                    op: "answer",
                    status,
                });
            }
        }

        let answered_at = get_timestamp();
        let session = {
            let mut session = active.session.write().unwrap();
            session.status = CallStatus::Answered;
            session.answered_at = Some(answered_at);
            session.answer = Some(answer.clone());
            session.clone()
        };

        let call_id = incoming.id.clone();
        let write_result = async {
            self.write_mirrored(&session, |owner| paths::answer(owner, &call_id), json!(answer))
                .await?;
            self.write_mirrored(
                &session,
                |owner| paths::answered_at(owner, &call_id),
                json!(answered_at),
            )
            .await?;
            self.write_mirrored(
                &session,
                |owner| paths::status(owner, &call_id),
                json!("answered"),
            )
            .await
        }
        .await;
        if let Err(e) = write_result {
            active.cleanup().await;
            return Err(e);
        }

        let (_timer_tx, timer_rx) = unbounded_channel();
        let channels = match self.open_channels(&call_id, timer_rx, media_events).await {
            Ok(channels) => channels,
            Err(e) => {
                active.cleanup().await;
                return Err(e);
            }
        };
        self.spawn_serve(active.clone(), channels);
        active.publish_local_candidates(to_publish).await;

        info!(call_id, user_id = self.inner.user_id, "call answered");
        self.emit(CallEvent::Answered {
            call_id,
            answered_at,
            timestamp: answered_at,
        });
        Ok(())
    }

    /// Decline a ringing incoming call. No media engine involvement; the
    /// capability was never acquired for it.
    pub async fn decline_call(&self, incoming: &CallSession) -> Result<(), CallError> {
        match self.inner.guard.try_apply(&incoming.id, CallStatus::Declined) {
            TransitionOutcome::Applied => {}
            TransitionOutcome::Duplicate => return Ok(()),
            TransitionOutcome::Rejected => {
                return Err(CallError::InvalidState {
                    op: "decline",
                    status: self
                        .inner
                        .guard
                        .current(&incoming.id)
                        .unwrap_or(incoming.status),
                });
            }
        }
        let now = get_timestamp();
        let call_id = incoming.id.clone();
        self.write_mirrored(incoming, |owner| paths::ended_at(owner, &call_id), json!(now))
            .await?;
        self.write_mirrored(
            incoming,
            |owner| paths::status(owner, &call_id),
            json!("declined"),
        )
        .await?;
        info!(call_id, user_id = self.inner.user_id, "call declined");
        self.emit(CallEvent::Declined {
            call_id,
            timestamp: now,
        });
        Ok(())
    }

    /// Hang up the active call, if any. Returns the final record with
    /// `duration` computed from answer to end (zero if never answered).
    pub async fn end_call(&self) -> Result<Option<CallSession>, CallError> {
        let active = self.inner.active.lock().unwrap().clone();
        match active {
            Some(active) => active.hangup(EndReason::Hangup).await.map(Some),
            None => Ok(None),
        }
    }

    /// One-shot scan of the local namespace for fresh foreign ringing
    /// records. Stale records (older than the staleness window) are ghost
    /// calls left behind by crashes and are skipped silently.
    pub async fn check_for_pending_calls(&self) -> Result<bool, CallError> {
        let path = paths::user_root(&self.inner.user_id);
        let root = self
            .inner
            .store
            .read_once(&path)
            .await
            .map_err(|source| CallError::SignalingWrite { path, source })?;
        let records = match root.as_ref().and_then(|v| v.as_object()) {
            Some(records) => records,
            None => return Ok(false),
        };
        let now = get_timestamp();
        let mut found = false;
        for (call_id, node) in records {
            let session: CallSession = match serde_json::from_value(node.clone()) {
                Ok(session) => session,
                Err(e) => {
                    warn!(call_id, "skipping unparseable call record: {}", e);
                    continue;
                }
            };
            if session.caller_id == self.inner.user_id {
                continue;
            }
            if session.status != CallStatus::Ringing {
                continue;
            }
            if session.is_stale(now, self.inner.config.stale_after_millis()) {
                debug!(call_id, "stale ringing record ignored");
                continue;
            }
            match self.inner.guard.current(call_id) {
                Some(CallStatus::Ringing) => {
                    // already surfaced by the listener or an earlier check
                    found = true;
                    continue;
                }
                // resolved locally; the store mirror is still catching up
                Some(_) => continue,
                None => {}
            }
            if self.inner.active.lock().unwrap().is_some() {
                self.decline_busy(&session).await;
                continue;
            }
            found = true;
            self.surface_incoming(session, self.inner.token.child_token());
        }
        Ok(found)
    }

    /// Resolve an incoming call remotely while another session is active.
    /// Nothing surfaces locally; the caller observes a decline.
    async fn decline_busy(&self, session: &CallSession) {
        info!(call_id = session.id, "busy, auto-declining second incoming call");
        self.inner.guard.track(&session.id, CallStatus::Declined);
        let now = get_timestamp();
        let call_id = session.id.clone();
        if let Err(e) = self
            .write_mirrored(session, |owner| paths::ended_at(owner, &call_id), json!(now))
            .await
        {
            warn!(call_id, "busy decline write failed: {}", e);
        }
        if let Err(e) = self
            .write_mirrored(
                session,
                |owner| paths::status(owner, &call_id),
                json!("declined"),
            )
            .await
        {
            warn!(call_id, "busy decline write failed: {}", e);
        }
    }

    /// Continuous watch of the local namespace. New fresh foreign ringing
    /// records surface as `Incoming` events; a second incoming call while
    /// one session is active is auto-declined (busy).
    pub async fn start_listening(&self) -> Result<CallListener, CallError> {
        let path = paths::user_root(&self.inner.user_id);
        let mut sub = self
            .inner
            .store
            .subscribe_child_added(&path)
            .await
            .map_err(|source| CallError::SignalingWrite { path, source })?;
        let token = self.inner.token.child_token();
        let listener_token = token.clone();
        let client = self.clone();
        tokio::spawn(async move {
            loop {
                select! {
                    _ = listener_token.cancelled() => break,
                    update = sub.receiver.recv() => {
                        match update {
                            Some(update) => {
                                client.handle_listed_record(update.value, &listener_token).await;
                            }
                            None => break,
                        }
                    }
                }
            }
            debug!(user_id = client.inner.user_id, "call listener stopped");
        });
        Ok(CallListener { token })
    }

    async fn handle_listed_record(&self, value: Value, listener_token: &CancellationToken) {
        let session: CallSession = match serde_json::from_value(value) {
            Ok(session) => session,
            Err(_) => return,
        };
        if session.caller_id == self.inner.user_id {
            return;
        }
        if session.status != CallStatus::Ringing {
            return;
        }
        let now = get_timestamp();
        if session.is_stale(now, self.inner.config.stale_after_millis()) {
            debug!(call_id = session.id, "stale ringing record ignored");
            return;
        }
        if self.inner.guard.current(&session.id).is_some() {
            return;
        }
        if self.inner.active.lock().unwrap().is_some() {
            self.decline_busy(&session).await;
            return;
        }
        self.surface_incoming(session, listener_token.child_token());
    }

    /// Emit `Incoming` and keep a status watch on the record until it is
    /// answered or resolved, so a caller-side `missed`/`ended` dismisses
    /// an unanswered ring.
    fn surface_incoming(&self, session: CallSession, token: CancellationToken) {
        self.inner.guard.track(&session.id, CallStatus::Ringing);
        info!(
            call_id = session.id,
            caller_id = session.caller_id,
            "incoming call"
        );
        self.emit(CallEvent::Incoming {
            call: session.clone(),
            timestamp: get_timestamp(),
        });
        let client = self.clone();
        tokio::spawn(async move {
            client.watch_pending(session, token).await;
        });
    }

    async fn watch_pending(&self, session: CallSession, token: CancellationToken) {
        let status_path = paths::status(&self.inner.user_id, &session.id);
        let mut sub = match self.inner.store.subscribe_value(&status_path).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!(call_id = session.id, "pending-call watch failed: {}", e);
                return;
            }
        };
        loop {
            let update = select! {
                _ = token.cancelled() => break,
                update = sub.receiver.recv() => match update {
                    Some(update) => update,
                    None => break,
                },
            };
            let status: CallStatus = match serde_json::from_value(update.value) {
                Ok(status) => status,
                Err(_) => continue,
            };
            if status == CallStatus::Answered {
                // answered locally; the session loop owns it from here
                break;
            }
            if !status.is_terminal() {
                continue;
            }
            if self.inner.guard.try_apply(&session.id, status) == TransitionOutcome::Applied {
                let now = get_timestamp();
                match status {
                    CallStatus::Declined => self.emit(CallEvent::Declined {
                        call_id: session.id.clone(),
                        timestamp: now,
                    }),
                    CallStatus::Missed => self.emit(CallEvent::Missed {
                        call_id: session.id.clone(),
                        timestamp: now,
                    }),
                    CallStatus::Ended => self.emit(CallEvent::Ended {
                        call_id: session.id.clone(),
                        reason: EndReason::RemoteHangup,
                        duration: 0,
                        timestamp: now,
                    }),
                    _ => {}
                }
            }
            break;
        }
    }
}
