//! Stuck-Worker Handler (SWH).
//!
//! Escalates a worker/task binding through a fixed recovery ladder once it
//! has run past `warning_ms`: the 1st evaluation extends the deadline, the
//! 2nd reassigns the item, the 3rd onward restarts the worker, and once
//! `max_recovery_attempts` unsuccessful attempts have accumulated the
//! binding escalates to critical and the pipeline pauses (if configured).
//! The ladder advances by attempt count, one step per `check()` call, not
//! by which elapsed-time bucket the binding happens to be in when
//! observed — a binding first seen well past `critical_ms` still starts
//! at the deadline-extension step. Escalation is monotonic per binding:
//! once critical has fired, further calls are no-ops until `clear()`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use controller_common::config::StuckConfig;
use controller_common::ids::{ItemId, WorkerId};
use controller_common::types::{ControllerEvent, EscalationLevel, EscalationRecord};

use crate::metrics::EventPlane;

#[async_trait]
pub trait DeadlineExtensionHandler: Send + Sync {
    async fn extend_deadline(&self, worker_id: WorkerId, item_id: ItemId, extension_ms: u64) -> bool;
}

#[async_trait]
pub trait ReassignmentHandler: Send + Sync {
    async fn reassign(&self, worker_id: WorkerId, item_id: ItemId) -> bool;
}

#[async_trait]
pub trait RestartHandler: Send + Sync {
    async fn restart(&self, worker_id: WorkerId) -> bool;
}

#[async_trait]
pub trait PipelinePauseHandler: Send + Sync {
    async fn pause(&self, reason: String);
}

pub struct StuckWorkerHandler {
    config: StuckConfig,
    records: Mutex<HashMap<(WorkerId, ItemId), EscalationRecord>>,
    paused: AtomicBool,
    events: EventPlane,
}

impl StuckWorkerHandler {
    pub fn new(config: StuckConfig, events: EventPlane) -> Self {
        Self {
            config,
            records: Mutex::new(HashMap::new()),
            paused: AtomicBool::new(false),
            events,
        }
    }

    /// `true` once a critical escalation has paused new submissions.
    /// In-flight executors are unaffected — only ingestion is gated.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Evaluate one `(worker, item)` binding against its elapsed running
    /// time and fire whichever ladder step is next for it.
    #[allow(clippy::too_many_arguments)]
    pub async fn check(
        &self,
        worker_id: WorkerId,
        item_id: ItemId,
        started_at_epoch: i64,
        now_epoch: i64,
        deadline_handler: &dyn DeadlineExtensionHandler,
        reassignment: &dyn ReassignmentHandler,
        restart: &dyn RestartHandler,
        pause_handler: &dyn PipelinePauseHandler,
    ) {
        let elapsed_ms = (now_epoch - started_at_epoch).max(0) as u64;
        if elapsed_ms < self.config.warning_ms {
            return;
        }

        let key = (worker_id, item_id.clone());
        let (attempt_count, level) = {
            let mut records = self.records.lock().unwrap();
            let record = records.entry(key).or_insert_with(|| EscalationRecord {
                worker_id,
                item_id: Some(item_id.clone()),
                level: EscalationLevel::Warning,
                elapsed_ms: 0,
                attempt_count: 0,
                recorded_at: now_epoch,
            });
            // Escalation already resolved to critical; nothing further to
            // do for this binding until `clear` resets it.
            if record.level == EscalationLevel::Critical {
                return;
            }
            record.attempt_count += 1;
            record.elapsed_ms = elapsed_ms;
            record.recorded_at = now_epoch;
            let level = if record.attempt_count > self.config.max_recovery_attempts {
                EscalationLevel::Critical
            } else if record.attempt_count == 1 {
                EscalationLevel::Warning
            } else {
                EscalationLevel::Stuck
            };
            record.level = level;
            (record.attempt_count, level)
        };

        self.events.record_event(ControllerEvent::RecoveryAttempted {
            worker_id,
            item_id: item_id.clone(),
            level,
        });

        // 1st attempt extends the deadline, 2nd reassigns, 3rd onward
        // restarts, until `max_recovery_attempts` is exceeded and the
        // binding escalates to critical.
        let succeeded = match attempt_count {
            1 => {
                deadline_handler
                    .extend_deadline(worker_id, item_id.clone(), self.config.deadline_extension_ms)
                    .await
            }
            2 => reassignment.reassign(worker_id, item_id.clone()).await,
            n if n <= self.config.max_recovery_attempts => restart.restart(worker_id).await,
            _ => {
                self.events.record_event(ControllerEvent::CriticalEscalation {
                    worker_id,
                    item_id: item_id.clone(),
                });
                if self.config.pause_on_critical {
                    self.paused.store(true, Ordering::Release);
                    let reason = format!(
                        "worker {worker_id} stuck on item {item_id} past {} recovery attempts",
                        self.config.max_recovery_attempts
                    );
                    pause_handler.pause(reason.clone()).await;
                    self.events.record_event(ControllerEvent::PipelinePaused { reason });
                }
                true
            }
        };

        if succeeded {
            self.events.record_event(ControllerEvent::RecoverySucceeded {
                worker_id,
                item_id,
                level,
            });
        } else {
            self.events.record_event(ControllerEvent::RecoveryFailed {
                worker_id,
                item_id,
                level,
            });
        }
    }

    /// Clear a binding's escalation record once the item completes or the
    /// worker is released, so a future rebind starts from a clean slate.
    pub fn clear(&self, worker_id: WorkerId, item_id: &ItemId) {
        self.records.lock().unwrap().remove(&(worker_id, item_id.clone()));
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StuckConfig {
        StuckConfig {
            warning_ms: 1000,
            stuck_ms: 5000,
            critical_ms: 10000,
            deadline_extension_ms: 2000,
            max_recovery_attempts: 3,
            pause_on_critical: true,
        }
    }

    struct AlwaysSucceed;
    #[async_trait]
    impl DeadlineExtensionHandler for AlwaysSucceed {
        async fn extend_deadline(&self, _w: WorkerId, _i: ItemId, _ms: u64) -> bool {
            true
        }
    }
    #[async_trait]
    impl ReassignmentHandler for AlwaysSucceed {
        async fn reassign(&self, _w: WorkerId, _i: ItemId) -> bool {
            true
        }
    }
    #[async_trait]
    impl RestartHandler for AlwaysSucceed {
        async fn restart(&self, _w: WorkerId) -> bool {
            true
        }
    }
    #[async_trait]
    impl PipelinePauseHandler for AlwaysSucceed {
        async fn pause(&self, _reason: String) {}
    }

    struct Recording {
        calls: Mutex<Vec<&'static str>>,
    }
    impl Recording {
        fn new() -> Self {
            Self { calls: Mutex::new(Vec::new()) }
        }
    }
    #[async_trait]
    impl DeadlineExtensionHandler for Recording {
        async fn extend_deadline(&self, _w: WorkerId, _i: ItemId, _ms: u64) -> bool {
            self.calls.lock().unwrap().push("extend");
            true
        }
    }
    #[async_trait]
    impl ReassignmentHandler for Recording {
        async fn reassign(&self, _w: WorkerId, _i: ItemId) -> bool {
            self.calls.lock().unwrap().push("reassign");
            true
        }
    }
    #[async_trait]
    impl RestartHandler for Recording {
        async fn restart(&self, _w: WorkerId) -> bool {
            self.calls.lock().unwrap().push("restart");
            true
        }
    }
    #[async_trait]
    impl PipelinePauseHandler for Recording {
        async fn pause(&self, _reason: String) {
            self.calls.lock().unwrap().push("pause");
        }
    }

    #[tokio::test]
    async fn escalation_ladder_sequences_by_attempt_not_elapsed_bucket() {
        let swh = StuckWorkerHandler::new(config(), EventPlane::new("controller", 64));
        let worker = WorkerId::new();
        let item = ItemId::from("A");
        let handler = Recording::new();

        // First observation already lands past stuck_ms (5000); it must
        // still fire the first ladder step, not jump ahead.
        swh.check(worker, item.clone(), 0, 5500, &handler, &handler, &handler, &handler)
            .await;
        swh.check(worker, item.clone(), 0, 6000, &handler, &handler, &handler, &handler)
            .await;
        swh.check(worker, item.clone(), 0, 6500, &handler, &handler, &handler, &handler)
            .await;
        assert!(!swh.is_paused());

        // Fourth observation exceeds max_recovery_attempts (3) and escalates.
        swh.check(worker, item.clone(), 0, 7000, &handler, &handler, &handler, &handler)
            .await;

        assert_eq!(
            *handler.calls.lock().unwrap(),
            vec!["extend", "reassign", "restart", "pause"]
        );
        assert!(swh.is_paused());
    }

    #[tokio::test]
    async fn clear_resets_binding() {
        let swh = StuckWorkerHandler::new(config(), EventPlane::new("controller", 64));
        let worker = WorkerId::new();
        let item = ItemId::from("A");
        let handler = AlwaysSucceed;

        swh.check(worker, item.clone(), 0, 1500, &handler, &handler, &handler, &handler)
            .await;
        swh.clear(worker, &item);
        assert!(swh.records.lock().unwrap().is_empty());
    }
}
