use serde::{Deserialize, Serialize};

use crate::ids::{ItemId, WorkerId};

/// Escalation levels applied by the Stuck-Worker Handler.
/// Monotonic per `(worker, task)` binding — a level never re-fires a
/// lower one for the same binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    Warning,
    Stuck,
    Critical,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub worker_id: WorkerId,
    pub item_id: Option<ItemId>,
    pub level: EscalationLevel,
    pub elapsed_ms: u64,
    pub attempt_count: u32,
    pub recorded_at: i64,
}
