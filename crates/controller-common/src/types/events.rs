use serde::{Deserialize, Serialize};

use crate::ids::{ItemId, WorkerId};
use crate::types::{DeadLetterReason, EscalationLevel};

/// Typed change events published on the Metrics/Event Plane broadcast
/// channel. Subscribers observe per-component events
/// in emission order; `task_dequeued` always precedes the resulting
/// `task_started`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerEvent {
    // --- Bounded Work Queue ---
    TaskEnqueued { item_id: ItemId },
    TaskDequeued { item_id: ItemId },
    TaskRejected { item_id: ItemId, reason: String },
    TaskDropped { item_id: ItemId, reason: DeadLetterReason },
    BackpressureActivated,
    BackpressureReleased,
    SoftLimitWarning,

    // --- Worker Pool Manager ---
    TaskStarted { worker_id: WorkerId, item_id: ItemId },
    TaskCompleted { worker_id: WorkerId, item_id: ItemId },
    TaskFailed { worker_id: WorkerId, item_id: ItemId, error: String },

    // --- Health Monitor ---
    HeartbeatReceived { worker_id: WorkerId },
    ZombieDetected { worker_id: WorkerId },
    WorkerRestarted { worker_id: WorkerId },
    WorkerRestartFailed { worker_id: WorkerId, error: String },
    TaskReassigned { item_id: ItemId, from: WorkerId, to: Option<WorkerId> },
    MemoryThresholdExceeded { worker_id: WorkerId, memory_bytes: u64 },

    // --- Stuck-Worker Handler ---
    RecoveryAttempted { worker_id: WorkerId, item_id: ItemId, level: EscalationLevel },
    RecoverySucceeded { worker_id: WorkerId, item_id: ItemId, level: EscalationLevel },
    RecoveryFailed { worker_id: WorkerId, item_id: ItemId, level: EscalationLevel },
    CriticalEscalation { worker_id: WorkerId, item_id: ItemId },
    PipelinePaused { reason: String },

    /// Emitted when a slow subscriber is detached instead of blocking the
    /// emitter.
    SubscriberDropped { lagged_messages: u64 },
}
