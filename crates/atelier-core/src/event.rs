use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::pipeline::Phase;

/// Events published by the blackboard and the pipeline orchestrator.
///
/// Delivery is best-effort: observers that lag are dropped by the
/// broadcast channel and are expected to fall back to polling a status
/// snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SystemEvent {
    /// A task row was created.
    TaskCreated {
        /// Task id.
        task_id: i64,
        /// Agent identity the task targets, if any.
        agent: Option<String>,
    },
    /// A task was claimed by an agent.
    TaskClaimed {
        /// Task id.
        task_id: i64,
        /// Winning agent.
        agent: String,
    },
    /// A task completed.
    TaskCompleted {
        /// Task id.
        task_id: i64,
        /// Agent that completed it.
        agent: String,
    },
    /// A task failed.
    TaskFailed {
        /// Task id.
        task_id: i64,
        /// Agent that failed it.
        agent: String,
        /// Failure message.
        error: String,
    },
    /// A failed task was re-queued.
    TaskRetried {
        /// Task id.
        task_id: i64,
        /// Retry ordinal after the re-queue.
        retry_count: u32,
    },
    /// An artifact was persisted.
    ArtifactCreated {
        /// Root task the artifact belongs to.
        task_id: i64,
        /// Artifact name.
        name: String,
    },
    /// A pipeline row was created.
    PipelineCreated {
        /// Pipeline id.
        pipeline_id: i64,
    },
    /// A pipeline started running.
    PipelineStarted {
        /// Pipeline id.
        pipeline_id: i64,
    },
    /// A phase subtask was created.
    PhaseStarted {
        /// Pipeline id.
        pipeline_id: i64,
        /// The phase.
        phase: Phase,
    },
    /// A phase subtask completed.
    PhaseCompleted {
        /// Pipeline id.
        pipeline_id: i64,
        /// The phase.
        phase: Phase,
    },
    /// Staging changes are awaiting review.
    StagingReady {
        /// Pipeline id.
        pipeline_id: i64,
        /// Number of pending changes.
        change_count: usize,
    },
    /// Staging changes were approved and applied.
    StagingApproved {
        /// Pipeline id.
        pipeline_id: i64,
        /// Paths written.
        applied: Vec<String>,
    },
    /// Staging changes were rejected.
    StagingRejected {
        /// Pipeline id.
        pipeline_id: i64,
    },
    /// Applied changes were reverted.
    RolledBack {
        /// Pipeline id.
        pipeline_id: i64,
        /// Paths restored.
        restored: Vec<String>,
    },
    /// A pipeline finished all phases.
    PipelineCompleted {
        /// Pipeline id.
        pipeline_id: i64,
    },
    /// A pipeline failed.
    PipelineFailed {
        /// Pipeline id.
        pipeline_id: i64,
        /// Failure reason.
        error: String,
    },
}

/// Injectable best-effort pub/sub bus.
///
/// Owned by the caller and handed to the blackboard and orchestrator;
/// never ambient global state. A send with no subscribers is not an
/// error.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    /// Create a bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Best-effort: errors (no subscribers) are ignored.
    pub fn emit(&self, event: SystemEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to all events from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
