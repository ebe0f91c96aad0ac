//! Pipeline event types and the EventBus
//!
//! The batch orchestrator emits events here; progress reporters subscribe.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Pipeline events
///
/// Serializable so a reporter can forward them as JSON lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    /// Batch run started
    RunStarted {
        /// Run identifier
        run_id: Uuid,
        /// Number of tracks scheduled
        total: usize,
        /// Concurrency cap for this run
        concurrency: usize,
        /// When the run started
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// One track reached a terminal outcome
    TrackFinished {
        /// Run identifier
        run_id: Uuid,
        /// Track identifier
        track_id: String,
        /// Outcome kind ("success", "no_match", "failed", "skipped", "cancelled")
        outcome: String,
        /// Tracks finished so far, this one included
        completed: usize,
        /// Number of tracks scheduled
        total: usize,
        /// When the track finished
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Batch run finished
    RunFinished {
        /// Run identifier
        run_id: Uuid,
        success: usize,
        no_match: usize,
        failed: usize,
        skipped: usize,
        cancelled: usize,
        /// Wall-clock duration of the run
        duration_ms: u64,
        /// When the run finished
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Batch run was cancelled before every track finished
    RunCancelled {
        /// Run identifier
        run_id: Uuid,
        /// Tracks finished before cancellation took effect
        completed: usize,
        /// Number of tracks scheduled
        total: usize,
        /// When cancellation was observed
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl PipelineEvent {
    /// Event type name, for logging
    pub fn event_type(&self) -> &str {
        match self {
            PipelineEvent::RunStarted { .. } => "RunStarted",
            PipelineEvent::TrackFinished { .. } => "TrackFinished",
            PipelineEvent::RunFinished { .. } => "RunFinished",
            PipelineEvent::RunCancelled { .. } => "RunCancelled",
        }
    }

    /// Run this event belongs to
    pub fn run_id(&self) -> Uuid {
        match self {
            PipelineEvent::RunStarted { run_id, .. }
            | PipelineEvent::TrackFinished { run_id, .. }
            | PipelineEvent::RunFinished { run_id, .. }
            | PipelineEvent::RunCancelled { run_id, .. } => *run_id,
        }
    }
}

/// Broadcast bus for pipeline events
///
/// Cloning shares the underlying channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// Slow subscribers lag once `capacity` events are buffered; old events are dropped.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
