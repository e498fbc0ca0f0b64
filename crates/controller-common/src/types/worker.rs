use serde::{Deserialize, Serialize};

use crate::ids::{ItemId, WorkerId};

/// Worker slot status. Heartbeats are authoritative for this
/// field while a task is bound; it becomes `Error` only after escalation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Working,
    Error,
}

/// A fixed pool slot owned exclusively by the Worker Pool Manager.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerSlot {
    pub worker_id: WorkerId,
    pub status: WorkerStatus,
    pub current_item: Option<ItemId>,
    pub started_at_epoch: Option<i64>,
    pub completed_count: u64,
    pub last_error: Option<String>,
    pub restart_count: u32,
    pub last_restart_epoch: Option<i64>,
}

impl WorkerSlot {
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            status: WorkerStatus::Idle,
            current_item: None,
            started_at_epoch: None,
            completed_count: 0,
            last_error: None,
            restart_count: 0,
            last_restart_epoch: None,
        }
    }

    /// Invariant: `current_item` is non-none iff `status = working`.
    pub fn is_consistent(&self) -> bool {
        self.current_item.is_some() == matches!(self.status, WorkerStatus::Working)
    }
}

/// A heartbeat reported by a bound worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker_id: WorkerId,
    pub timestamp_epoch: i64,
    pub status: WorkerStatus,
    pub current_task: Option<ItemId>,
    pub memory_bytes: u64,
    pub cpu_ratio: Option<f64>,
    pub progress: Option<f64>,
}

/// Health Monitor state machine per worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Zombie,
    Restarting,
    /// Terminal — restart attempts exhausted, requires external clear.
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub worker_id: WorkerId,
    pub last_heartbeat: Option<i64>,
    pub missed_heartbeats: u32,
    pub health_status: HealthStatus,
    pub restart_attempts: u32,
}

impl WorkerHealth {
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            last_heartbeat: None,
            missed_heartbeats: 0,
            health_status: HealthStatus::Healthy,
            restart_attempts: 0,
        }
    }
}
