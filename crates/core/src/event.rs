//! Domain event system: observers of the orchestrator without coupling.
//!
//! Events are published when a turn starts, a generation completes, a tool
//! runs, or a turn finishes. Subscribers filter for what they care about.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::ErrorKind;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A turn entered the orchestration loop
    TurnStarted {
        session_id: String,
        resumed: bool,
        timestamp: DateTime<Utc>,
    },

    /// The engine produced a complete generation
    GenerationCompleted {
        session_id: String,
        iteration: u32,
        model: String,
        tokens_used: Option<u32>,
        timestamp: DateTime<Utc>,
    },

    /// A tool call was executed (or deferred to the user)
    ToolExecuted {
        session_id: String,
        tool_name: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A turn ended. `error` is `None` for answers and pending tools.
    TurnFinished {
        session_id: String,
        iterations: u32,
        error: Option<ErrorKind>,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
