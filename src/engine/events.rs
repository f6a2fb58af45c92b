// Lifecycle events emitted by the flow engine

//! # Event System
//!
//! The engine collects [`FlowEvent`]s in an outbox while it holds a process
//! lock and publishes them on the [`EventBus`] only after the lock has been
//! released. Subscribers therefore never observe state that could still be
//! rolled back, and a slow subscriber never extends a lock hold.
//!
//! Audit logging, outbound messaging and subprocess completion all attach
//! here through [`EventBus::subscribe`].

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::{ProcessId, TaskId};

/// Named lifecycle notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FlowEvent {
    FlowStarted {
        process: ProcessId,
        flow: String,
    },
    FlowFinished {
        process: ProcessId,
        flow: String,
        /// Subprocess task waiting on this process, if any
        parent_task: Option<TaskId>,
    },
    TaskStarted {
        process: ProcessId,
        task: TaskId,
        node: String,
    },
    TaskFinished {
        process: ProcessId,
        task: TaskId,
        node: String,
    },
    TaskFailed {
        process: ProcessId,
        task: TaskId,
        node: String,
        error: String,
    },
}

impl FlowEvent {
    pub fn process(&self) -> ProcessId {
        match self {
            FlowEvent::FlowStarted { process, .. }
            | FlowEvent::FlowFinished { process, .. }
            | FlowEvent::TaskStarted { process, .. }
            | FlowEvent::TaskFinished { process, .. }
            | FlowEvent::TaskFailed { process, .. } => *process,
        }
    }

    pub fn task(&self) -> Option<TaskId> {
        match self {
            FlowEvent::TaskStarted { task, .. }
            | FlowEvent::TaskFinished { task, .. }
            | FlowEvent::TaskFailed { task, .. } => Some(*task),
            FlowEvent::FlowStarted { .. } | FlowEvent::FlowFinished { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FlowEvent::FlowStarted { .. } => "flow_started",
            FlowEvent::FlowFinished { .. } => "flow_finished",
            FlowEvent::TaskStarted { .. } => "task_started",
            FlowEvent::TaskFinished { .. } => "task_finished",
            FlowEvent::TaskFailed { .. } => "task_failed",
        }
    }
}

/// Broadcast bus for publishing and subscribing to flow events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<FlowEvent>,
}

impl EventBus {
    /// Create a bus that buffers up to `capacity` events per slow subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Publishing with no subscribers is not an error.
    pub fn publish(&self, event: FlowEvent) {
        debug!(
            event = event.name(),
            process_id = %event.process(),
            task_id = ?event.task(),
            "event published"
        );
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
