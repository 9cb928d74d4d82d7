//! Conversion progress events
//!
//! The orchestrator publishes a [`ConversionEvent`] on every lifecycle change.
//! Delivery is best-effort: events emitted while nobody is subscribed are dropped,
//! and slow receivers observe `RecvError::Lagged` rather than blocking the sender.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::ProcessingStage;

/// Conversion lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConversionEvent {
    /// Admission ceiling reached; task waits in the FIFO queue
    TaskQueued {
        task_id: Uuid,
        /// 1-based position in the admission queue
        position: usize,
        timestamp: DateTime<Utc>,
    },

    /// Task entered PROCESSING
    TaskStarted {
        task_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// Checkpoint persisted
    TaskProgress {
        task_id: Uuid,
        stage: ProcessingStage,
        progress: u8,
        timestamp: DateTime<Utc>,
    },

    /// MIDI artifact written
    TaskCompleted {
        task_id: Uuid,
        output_path: String,
        note_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// A stage failed
    TaskFailed {
        task_id: Uuid,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Cancelled by the user or by a timeout
    TaskCancelled {
        task_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// Cleanup sweep finished
    TasksCleanedUp {
        removed: usize,
        timestamp: DateTime<Utc>,
    },
}

impl ConversionEvent {
    /// Task the event refers to, if any
    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            ConversionEvent::TaskQueued { task_id, .. }
            | ConversionEvent::TaskStarted { task_id, .. }
            | ConversionEvent::TaskProgress { task_id, .. }
            | ConversionEvent::TaskCompleted { task_id, .. }
            | ConversionEvent::TaskFailed { task_id, .. }
            | ConversionEvent::TaskCancelled { task_id, .. } => Some(*task_id),
            ConversionEvent::TasksCleanedUp { .. } => None,
        }
    }

    /// Event type name, matching the serialized `type` tag
    pub fn event_type(&self) -> &'static str {
        match self {
            ConversionEvent::TaskQueued { .. } => "TaskQueued",
            ConversionEvent::TaskStarted { .. } => "TaskStarted",
            ConversionEvent::TaskProgress { .. } => "TaskProgress",
            ConversionEvent::TaskCompleted { .. } => "TaskCompleted",
            ConversionEvent::TaskFailed { .. } => "TaskFailed",
            ConversionEvent::TaskCancelled { .. } => "TaskCancelled",
            ConversionEvent::TasksCleanedUp { .. } => "TasksCleanedUp",
        }
    }
}

/// Broadcast bus for [`ConversionEvent`]s
///
/// Cloning shares the underlying channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ConversionEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus buffering up to `capacity` events per receiver
    ///
    /// ```
    /// use a2m_common::events::EventBus;
    ///
    /// let bus = EventBus::new(100);
    /// assert_eq!(bus.subscriber_count(), 0);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<ConversionEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns the number of receivers, or the event back when nobody listens.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: ConversionEvent,
    ) -> Result<usize, broadcast::error::SendError<ConversionEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring the case where no subscribers are listening
    pub fn emit_lossy(&self, event: ConversionEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
