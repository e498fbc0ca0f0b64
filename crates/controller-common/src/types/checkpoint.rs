use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ItemId, OrderId};

/// The fixed step order a work order moves through. Only the
/// first four steps are resumable; the last three restart from scratch.
pub const STEP_ORDER: &[Step] = &[
    Step::ContextAnalysis,
    Step::BranchCreation,
    Step::CodeGeneration,
    Step::TestGeneration,
    Step::Verification,
    Step::Commit,
    Step::ResultPersistence,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    ContextAnalysis,
    BranchCreation,
    CodeGeneration,
    TestGeneration,
    Verification,
    Commit,
    ResultPersistence,
}

impl Step {
    /// Whether progress at this step can be resumed from, rather than
    /// restarted from the step's beginning.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Step::ContextAnalysis | Step::BranchCreation | Step::CodeGeneration | Step::TestGeneration
        )
    }

    /// Successor in `STEP_ORDER`; wraps to the first step after the last
    /// one.
    pub fn next(&self) -> Step {
        let idx = STEP_ORDER.iter().position(|s| s == self).unwrap();
        STEP_ORDER[(idx + 1) % STEP_ORDER.len()]
    }
}

/// A durable per-order progress snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub order_id: OrderId,
    pub item_id: ItemId,
    pub step: Step,
    pub attempt_number: u32,
    pub resumable: bool,
    pub state: Value,
    pub created_at_epoch: i64,
}

impl Checkpoint {
    pub fn new(order_id: OrderId, item_id: ItemId, step: Step, attempt_number: u32, state: Value, created_at_epoch: i64) -> Self {
        Self {
            order_id,
            item_id,
            step,
            resumable: step.is_resumable(),
            attempt_number,
            state,
            created_at_epoch,
        }
    }
}
