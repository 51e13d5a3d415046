use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use super::model::{Interaction, PendingResponse};

/// Notifications for the real-time layer. Delivery is best effort.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    PendingCreated {
        pending: PendingResponse,
    },
    PendingCancelled {
        #[serde(rename = "pendingId")]
        pending_id: String,
        #[serde(rename = "postId")]
        post_id: String,
    },
    ResponseMaterialized {
        #[serde(rename = "pendingId")]
        pending_id: String,
        interaction: Interaction,
    },
    ResponseSkipped {
        #[serde(rename = "pendingId")]
        pending_id: String,
        #[serde(rename = "postId")]
        post_id: String,
    },
    ResponseRetrying {
        #[serde(rename = "pendingId")]
        pending_id: String,
        attempt: u32,
        #[serde(rename = "nextAttemptAt")]
        next_attempt_at: DateTime<Utc>,
        reason: String,
    },
    ResponseFailed {
        #[serde(rename = "pendingId")]
        pending_id: String,
        #[serde(rename = "postId")]
        post_id: String,
        reason: String,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
