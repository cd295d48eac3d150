//! Runtime event definitions and bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Runtime event types.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEvent {
    /// Container process created and started.
    Started {
        id: String,
        pid: u32,
        timestamp: DateTime<Utc>,
    },
    /// Stop signal delivered.
    Signaled {
        id: String,
        signal: String,
        timestamp: DateTime<Utc>,
    },
    /// Container process exited.
    Exited {
        id: String,
        code: Option<i32>,
        signal: Option<i32>,
        timestamp: DateTime<Utc>,
    },
    /// Container torn down.
    Destroyed { id: String, timestamp: DateTime<Utc> },
}

impl RuntimeEvent {
    /// ID of the container the event is about.
    #[must_use]
    pub fn container_id(&self) -> &str {
        match self {
            Self::Started { id, .. }
            | Self::Signaled { id, .. }
            | Self::Exited { id, .. }
            | Self::Destroyed { id, .. } => id,
        }
    }
}

/// Event bus for runtime events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RuntimeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }
}

impl EventBus {
    /// Create a new event bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }

    /// Publish an event.
    pub fn publish(&self, event: RuntimeEvent) {
        tracing::trace!(?event, "Publishing event");
        // Ignore SendError (no subscribers)
        let _ = self.sender.send(event);
    }
}
