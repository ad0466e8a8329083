//! Fan-out of device state deltas to dashboard sessions.
//!
//! The core only publishes; delivery (WebSocket rooms etc.) subscribes to the
//! broadcast channel elsewhere. Publishing never blocks and never fails the
//! caller.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::models::{ContentKind, Entry};

// ---

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    #[serde(rename_all = "camelCase")]
    DataUpdate { device_id: String, data: Value },

    #[serde(rename_all = "camelCase")]
    SettingsUpdate { device_id: String, settings: Value },

    #[serde(rename_all = "camelCase")]
    ContentUpdate {
        device_id: String,
        kind: ContentKind,
        entries: Vec<Value>,
        next_start_after: Option<DateTime<Utc>>,
    },
}

impl SyncEvent {
    pub fn device_id(&self) -> &str {
        match self {
            SyncEvent::DataUpdate { device_id, .. }
            | SyncEvent::SettingsUpdate { device_id, .. }
            | SyncEvent::ContentUpdate { device_id, .. } => device_id,
        }
    }

    /// Partial content update carrying freshly written entries.
    pub fn content<T: Serialize>(device_id: &str, kind: ContentKind, entries: &[Entry<T>]) -> Self {
        // ---
        SyncEvent::ContentUpdate {
            device_id: device_id.to_string(),
            kind,
            entries: entries
                .iter()
                .filter_map(|e| serde_json::to_value(e).ok())
                .collect(),
            next_start_after: None,
        }
    }
}

/// Fire-and-forget publish contract.
pub trait SyncPublisher: Send + Sync {
    fn publish(&self, event: SyncEvent);
}

/// Publisher backed by a tokio broadcast channel.
#[derive(Clone)]
pub struct BroadcastSync {
    tx: broadcast::Sender<SyncEvent>,
}

impl BroadcastSync {
    // ---
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}

impl SyncPublisher for BroadcastSync {
    fn publish(&self, event: SyncEvent) {
        // ---
        let device_id = event.device_id().to_string();
        // No subscribers just means no dashboard is watching
        if self.tx.send(event).is_err() {
            tracing::trace!("No sync subscribers for device {}", device_id);
        }
    }
}
