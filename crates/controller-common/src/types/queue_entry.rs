use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::ids::ItemId;
use crate::types::Priority;

/// A queued work item. Total order is `(priority desc, enqueued_at_epoch
/// asc)` — `Ord` is implemented by hand below so `BinaryHeap`
/// (a max-heap) pops the highest-ordered entry directly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub item_id: ItemId,
    pub priority: Priority,
    pub effort: u32,
    pub enqueued_at_epoch: i64,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority (P0) must sort greater than lower priority (P3),
        // so invert the natural P0<P1<P2<P3 ordering.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.enqueued_at_epoch.cmp(&self.enqueued_at_epoch))
            .then_with(|| self.item_id.cmp(&other.item_id))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Reason a queue entry was routed to the dead letter sideline instead of
/// being dispatched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    DroppedForNewer,
    LowerPriorityThanQueue,
    RejectedCapacity,
    RejectedMemory,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub item_id: ItemId,
    pub priority: Priority,
    pub effort: u32,
    pub enqueued_at_epoch: i64,
    pub reason: DeadLetterReason,
    pub dropped_at_epoch: i64,
}

/// Result of an `enqueue` call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOutcome {
    pub success: bool,
    pub reason: Option<String>,
}

impl EnqueueOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason.into()),
        }
    }
}

/// Snapshot returned by `BoundedWorkQueue::get_status`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub size: usize,
    pub max_size: usize,
    pub utilization_ratio: f64,
    pub backpressure_active: bool,
    pub soft_limit_warning: bool,
    pub memory_usage: u64,
}
