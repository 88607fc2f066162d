use anyhow::Error;
use serde::Deserialize;
use std::collections::HashMap;

/// Tunables for the signaling core. Everything has a sensible default so
/// embedders can use `SignalingConfig::default()` and override fields.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SignalingConfig {
    /// Ringing window before an unanswered outgoing call resolves to
    /// `missed`, in seconds.
    pub ring_timeout_secs: u64,
    /// Ringing records older than this are filtered out of pending-call
    /// detection instead of surfacing as ghost calls.
    pub stale_after_secs: u64,
    /// Capacity of the lifecycle event broadcast channel.
    pub event_channel_size: usize,
    pub notify: Option<NotifyConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotifyConfig {
    pub url: String,
    pub method: Option<String>,
    pub headers: Option<HashMap<String, String>>,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: 30,
            stale_after_secs: 120,
            event_channel_size: 64,
            notify: None,
        }
    }
}

impl SignalingConfig {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }

    pub fn ring_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.ring_timeout_secs)
    }

    pub fn stale_after_millis(&self) -> u64 {
        self.stale_after_secs * 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = SignalingConfig::default();
        assert_eq!(config.ring_timeout_secs, 30);
        assert_eq!(config.stale_after_secs, 120);
        assert!(config.notify.is_none());
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config: SignalingConfig = toml::from_str(
            r#"
            ring_timeout_secs = 5

            [notify]
            url = "http://localhost:9000/push"
            "#,
        )
        .unwrap();
        assert_eq!(config.ring_timeout_secs, 5);
        assert_eq!(config.stale_after_secs, 120);
        assert_eq!(config.notify.unwrap().url, "http://localhost:9000/push");
    }
}
