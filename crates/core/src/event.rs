//! Loop event bus — decoupled observation of what the engine is doing.
//!
//! Events are published when something interesting happens in a run.
//! Progress UIs and tests subscribe without being wired into the loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All loop events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LoopEvent {
    /// A new iteration of the orchestration loop started
    IterationStarted {
        session_id: String,
        iteration: usize,
        timestamp: DateTime<Utc>,
    },

    /// Context usage was measured
    ContextUsage {
        session_id: String,
        total_tokens: usize,
        window: usize,
        free_percent: f64,
        approximate: bool,
    },

    /// A failed model call will be retried
    RetryScheduled {
        attempt: u32,
        sleep_secs: u64,
        reason: String,
    },

    /// A compaction finished (applied or discarded)
    Compaction {
        session_id: String,
        before: usize,
        after: usize,
        applied: bool,
        timestamp: DateTime<Utc>,
    },

    /// A tool was executed
    ToolExecuted {
        tool_name: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// The model repeated itself
    LoopDetected { pattern: String, count: usize },

    /// The run ended
    Finished {
        session_id: String,
        terminal: String,
        iterations: usize,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for loop events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<LoopEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: LoopEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<LoopEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}
