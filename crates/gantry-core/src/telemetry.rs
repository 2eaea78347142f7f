use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// A named telemetry event with numeric measurements and free-form metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub name: String,
    pub measurements: HashMap<String, f64>,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Broadcast-based telemetry bus — observers subscribe, emitters fire and
/// forget. Lagging subscribers lose the oldest events.
#[derive(Clone)]
pub struct TelemetryBus {
    sender: Arc<broadcast::Sender<TelemetryEvent>>,
}

impl TelemetryBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn emit(
        &self,
        name: impl Into<String>,
        measurements: HashMap<String, f64>,
        metadata: serde_json::Value,
    ) {
        let event = TelemetryEvent {
            name: name.into(),
            measurements,
            metadata,
            timestamp: Utc::now(),
        };
        // Ignore send errors (no subscribers).
        let _ = self.sender.send(event);
    }

    /// Shorthand for events that only carry metadata.
    pub fn emit_meta(&self, name: impl Into<String>, metadata: serde_json::Value) {
        self.emit(name, HashMap::new(), metadata);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.sender.subscribe()
    }

    /// Spawn a background observer that logs every event at debug level.
    pub fn spawn_log_observer(&self) {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        debug!(name = %event.name, metadata = %event.metadata, "telemetry");
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "telemetry observer lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

impl Default for TelemetryBus {
    fn default() -> Self {
        Self::new(4096)
    }
}

/// Mask an API key for telemetry and logs: first 7 and last 4 characters
/// with an ellipsis between. Short keys are fully masked.
pub fn mask_key(key: &str) -> String {
    if key.len() <= 11 {
        return "***".into();
    }
    let prefix: String = key.chars().take(7).collect();
    let suffix: String = key.chars().skip(key.chars().count().saturating_sub(4)).collect();
    format!("{prefix}…{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscribers() {
        let bus = TelemetryBus::new(16);
        let mut rx = bus.subscribe();
        bus.emit_meta("router.decide", serde_json::json!({ "provider": "openai" }));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, "router.decide");
        assert_eq!(event.metadata["provider"], "openai");
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = TelemetryBus::new(4);
        bus.emit_meta("stream.stop", serde_json::json!({}));
    }

    #[test]
    fn mask_hides_middle() {
        let masked = mask_key("sk-abcdefghijklmnopqrstu");
        assert_eq!(masked, "sk-abcd…rstu");
        assert!(!masked.contains("efghijklmnop"));
    }

    #[test]
    fn mask_short_keys_entirely() {
        assert_eq!(mask_key("sk-short"), "***");
        assert_eq!(mask_key(""), "***");
    }
}
