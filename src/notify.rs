use crate::config::NotifyConfig;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use std::time::Instant;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Payload for the one-way push channel that wakes the callee's device.
#[derive(Debug, Clone)]
pub struct CallNotification {
    pub title: String,
    pub body: String,
    pub call_id: String,
    pub caller_name: String,
}

/// One-way, fire-and-forget push collaborator. Failure must never affect
/// call establishment; the dispatcher logs and moves on.
#[async_trait]
pub trait CallNotifier: Send + Sync {
    async fn notify(&self, callee_id: &str, notification: CallNotification) -> Result<()>;
}

/// Default notifier for embedders without a push channel.
pub struct NoopNotifier;

#[async_trait]
impl CallNotifier for NoopNotifier {
    async fn notify(&self, _callee_id: &str, _notification: CallNotification) -> Result<()> {
        Ok(())
    }
}

/// Delivers call notifications to an HTTP endpoint.
pub struct WebhookNotifier {
    url: String,
    method: Option<String>,
    headers: Option<Vec<(String, String)>>,
}

impl WebhookNotifier {
    pub fn new(
        url: String,
        method: Option<String>,
        headers: Option<Vec<(String, String)>>,
    ) -> Self {
        Self {
            url,
            method,
            headers,
        }
    }

    pub fn from_config(config: &NotifyConfig) -> Self {
        Self {
            url: config.url.clone(),
            method: config.method.clone(),
            headers: config
                .headers
                .as_ref()
                .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        }
    }
}

#[async_trait]
impl CallNotifier for WebhookNotifier {
    async fn notify(&self, callee_id: &str, notification: CallNotification) -> Result<()> {
        let client = Client::new();
        let payload = json!({
            "calleeId": callee_id,
            "callId": notification.call_id,
            "callerName": notification.caller_name,
            "title": notification.title,
            "body": notification.body,
            "sentAt": Utc::now().to_rfc3339(),
        });

        let method = self.method.as_deref().unwrap_or("POST");
        let mut request =
            client.request(reqwest::Method::from_bytes(method.as_bytes())?, &self.url);
        if let Some(headers) = &self.headers {
            for (key, value) in headers {
                request = request.header(key, value);
            }
        }
        let response = request.json(&payload).send().await?;
        response.error_for_status()?;
        Ok(())
    }
}

/// Spawn the dispatch so the caller never blocks on the push channel.
pub fn dispatch_notification(
    notifier: std::sync::Arc<dyn CallNotifier>,
    cancel_token: CancellationToken,
    callee_id: String,
    notification: CallNotification,
) {
    tokio::spawn(async move {
        let call_id = notification.call_id.clone();
        let start_time = Instant::now();
        select! {
            _ = cancel_token.cancelled() => {
                info!(call_id, callee_id, "call notification cancelled");
            }
            result = notifier.notify(&callee_id, notification) => {
                match result {
                    Ok(_) => {
                        info!(
                            call_id,
                            callee_id,
                            elapsed = start_time.elapsed().as_millis() as u64,
                            "call notification delivered"
                        );
                    }
                    Err(e) => {
                        warn!(call_id, callee_id, "call notification failed: {}", e);
                    }
                }
            }
        }
    });
}
