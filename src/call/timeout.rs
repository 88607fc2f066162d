use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Single-shot ringing-window timer. Expiry is delivered as a message to
/// the session loop rather than acted on in the timer task, so the
/// still-ringing check and the `missed` write happen on the same loop that
/// processes answer/decline notifications.
///
/// `cancel` is explicit and must be called before any competing terminal
/// write; only cancellation prevents a late spurious `missed`, the store
/// offers no guard of its own.
pub struct RingTimer {
    token: CancellationToken,
}

impl RingTimer {
    pub fn start(call_id: String, duration: Duration, expiry_tx: UnboundedSender<()>) -> Self {
        let token = CancellationToken::new();
        let task_token = token.clone();
        tokio::spawn(async move {
            select! {
                _ = task_token.cancelled() => {
                    debug!(call_id, "ring timer cancelled");
                }
                _ = sleep(duration) => {
                    debug!(call_id, "ring timer expired");
                    expiry_tx.send(()).ok();
                }
            }
        });
        Self { token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Drop for RingTimer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
