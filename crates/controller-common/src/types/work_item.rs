use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ids::ItemId;

/// Priority band for a work item. Ordered `P0 > P1 > P2 > P3`; the derived
/// `Ord` impl relies on declaration order, so `P0` must stay first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
}

/// Work item lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Pending,
    Ready,
    InProgress,
    Completed,
    Failed,
    InCycle,
}

impl WorkItemStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::InCycle => "in_cycle",
        }
    }
}

/// A unit of work handed into the controller. The core never mutates
/// `priority`, `effort`, or `depends_on` after ingestion — only
/// `status` is updated, and only by the core itself as items complete.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: ItemId,
    pub priority: Priority,
    pub effort: u32,
    pub status: WorkItemStatus,
    #[serde(default)]
    pub depends_on: BTreeSet<ItemId>,
    #[serde(default)]
    pub blocks: BTreeSet<ItemId>,
}

impl WorkItem {
    pub fn new(id: impl Into<ItemId>, priority: Priority, effort: u32) -> Self {
        Self {
            id: id.into(),
            priority,
            effort,
            status: WorkItemStatus::Pending,
            depends_on: BTreeSet::new(),
            blocks: BTreeSet::new(),
        }
    }
}
