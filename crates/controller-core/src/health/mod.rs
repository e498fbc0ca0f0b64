//! Health Monitor (HM).
//!
//! Tracks the liveness of every worker that has ever reported a heartbeat.
//! A worker is registered lazily on its first heartbeat rather than
//! up-front, since the pool doesn't know which slots will ever actually
//! bind to a task. Zombie detection and restart recovery are delegated to
//! the pool through the `ReassignmentHandler`/`RestartHandler` traits so
//! this module never has to know how a worker is actually reassigned or
//! restarted.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use controller_common::config::HealthConfig;
use controller_common::ids::{ItemId, WorkerId};
use controller_common::types::{ControllerEvent, Heartbeat, HealthStatus, WorkerHealth};

use crate::metrics::EventPlane;

#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("worker {0} is not registered")]
    UnknownWorker(WorkerId),
}

/// Called when a worker is declared a zombie and its in-flight item (if
/// any) needs to move to another worker.
#[async_trait]
pub trait ReassignmentHandler: Send + Sync {
    async fn reassign(&self, worker_id: WorkerId, item_id: Option<ItemId>);
}

/// Called to attempt bringing a zombie worker back into rotation.
/// Returns `true` if the restart succeeded.
#[async_trait]
pub trait RestartHandler: Send + Sync {
    async fn restart(&self, worker_id: WorkerId) -> bool;
}

struct Inner {
    workers: HashMap<WorkerId, WorkerHealth>,
    last_restart_attempt_epoch: HashMap<WorkerId, i64>,
}

/// The Health Monitor. Cloned handles share the same lock; `record_heartbeat`
/// is cheap enough to call from every worker loop iteration.
pub struct HealthMonitor {
    config: HealthConfig,
    inner: Mutex<Inner>,
    events: EventPlane,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, events: EventPlane) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                workers: HashMap::new(),
                last_restart_attempt_epoch: HashMap::new(),
            }),
            events,
        }
    }

    /// Record an incoming heartbeat. Auto-registers the worker on first
    /// sight and always resets `missed_heartbeats` to zero.
    pub fn record_heartbeat(&self, hb: &Heartbeat, now_epoch: i64) {
        {
            let mut inner = self.inner.lock().unwrap();
            let entry = inner
                .workers
                .entry(hb.worker_id)
                .or_insert_with(|| WorkerHealth::new(hb.worker_id));
            entry.last_heartbeat = Some(now_epoch);
            entry.missed_heartbeats = 0;
            // A fresh heartbeat only resolves a `Degraded` worker. `Zombie`
            // and `Restarting` are resolved by the reassign/restart handlers
            // alone, never by a stray late heartbeat racing them.
            if matches!(entry.health_status, HealthStatus::Healthy | HealthStatus::Degraded) {
                entry.health_status = HealthStatus::Healthy;
            }
        }
        self.events.record_event(ControllerEvent::HeartbeatReceived {
            worker_id: hb.worker_id,
        });
        if hb.memory_bytes > self.config.memory_threshold_bytes {
            self.events.record_event(ControllerEvent::MemoryThresholdExceeded {
                worker_id: hb.worker_id,
                memory_bytes: hb.memory_bytes,
            });
        }
    }

    pub fn get_worker_health(&self, worker_id: WorkerId) -> Result<WorkerHealth, HealthError> {
        self.inner
            .lock()
            .unwrap()
            .workers
            .get(&worker_id)
            .cloned()
            .ok_or(HealthError::UnknownWorker(worker_id))
    }

    pub fn get_all(&self) -> Vec<WorkerHealth> {
        self.inner.lock().unwrap().workers.values().cloned().collect()
    }

    /// One pass of the zombie sweep: for every registered worker, compare
    /// elapsed time since its last heartbeat against
    /// `heartbeat_interval_ms * missed_heartbeat_threshold`. Workers that
    /// cross the threshold are marked zombies, their in-flight item (if
    /// supplied by the caller) is reassigned, and a restart is attempted
    /// subject to `max_restarts` and `restart_cooldown_ms`.
    pub async fn sweep(
        &self,
        now_epoch: i64,
        current_item_of: impl Fn(WorkerId) -> Option<ItemId>,
        reassignment: &dyn ReassignmentHandler,
        restart: &dyn RestartHandler,
    ) {
        let zombie_threshold_ms =
            self.config.heartbeat_interval_ms * self.config.missed_heartbeat_threshold as u64;

        let zombies: Vec<WorkerId> = {
            let mut inner = self.inner.lock().unwrap();
            let mut zombies = Vec::new();
            for (worker_id, health) in inner.workers.iter_mut() {
                if health.health_status == HealthStatus::Restarting
                    || health.health_status == HealthStatus::Error
                {
                    continue;
                }
                let elapsed_ms = match health.last_heartbeat {
                    Some(last) => (now_epoch - last).max(0) as u64,
                    None => continue,
                };
                if elapsed_ms > zombie_threshold_ms {
                    health.missed_heartbeats += 1;
                    if health.health_status != HealthStatus::Zombie {
                        health.health_status = HealthStatus::Zombie;
                        zombies.push(*worker_id);
                    }
                } else if elapsed_ms
                    >= self.config.heartbeat_interval_ms * self.config.missed_heartbeat_threshold as u64 / 2
                {
                    health.health_status = HealthStatus::Degraded;
                }
            }
            zombies
        };

        for worker_id in zombies {
            self.events.record_event(ControllerEvent::ZombieDetected { worker_id });
            let item_id = current_item_of(worker_id);
            reassignment.reassign(worker_id, item_id.clone()).await;
            if let Some(item_id) = item_id {
                self.events.record_event(ControllerEvent::TaskReassigned {
                    item_id,
                    from: worker_id,
                    to: None,
                });
            }
            self.attempt_restart(worker_id, now_epoch, restart).await;
        }
    }

    async fn attempt_restart(&self, worker_id: WorkerId, now_epoch: i64, restart: &dyn RestartHandler) {
        let should_attempt = {
            let mut inner = self.inner.lock().unwrap();
            let health = match inner.workers.get(&worker_id) {
                Some(h) => h,
                None => return,
            };
            if health.restart_attempts >= self.config.max_restarts {
                return;
            }
            let last = inner
                .last_restart_attempt_epoch
                .get(&worker_id)
                .copied()
                .unwrap_or(0);
            let cooldown_elapsed = (now_epoch - last) as u64 >= self.config.restart_cooldown_ms;
            if cooldown_elapsed {
                inner.last_restart_attempt_epoch.insert(worker_id, now_epoch);
            }
            cooldown_elapsed
        };

        if !should_attempt {
            return;
        }

        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(health) = inner.workers.get_mut(&worker_id) {
                health.health_status = HealthStatus::Restarting;
                health.restart_attempts += 1;
            }
        }

        let succeeded = restart.restart(worker_id).await;

        let mut inner = self.inner.lock().unwrap();
        if let Some(health) = inner.workers.get_mut(&worker_id) {
            if succeeded {
                health.health_status = HealthStatus::Healthy;
                health.missed_heartbeats = 0;
                health.last_heartbeat = Some(now_epoch);
            } else {
                health.health_status = HealthStatus::Error;
            }
        }
        drop(inner);

        if succeeded {
            self.events.record_event(ControllerEvent::WorkerRestarted { worker_id });
        } else {
            self.events.record_event(ControllerEvent::WorkerRestartFailed {
                worker_id,
                error: "restart handler reported failure".to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HealthConfig {
        HealthConfig {
            heartbeat_interval_ms: 1000,
            health_check_interval_ms: 500,
            missed_heartbeat_threshold: 3,
            memory_threshold_bytes: 1_000_000,
            max_restarts: 2,
            restart_cooldown_ms: 0,
        }
    }

    struct NoopReassign;
    #[async_trait]
    impl ReassignmentHandler for NoopReassign {
        async fn reassign(&self, _worker_id: WorkerId, _item_id: Option<ItemId>) {}
    }

    struct AlwaysRestart;
    #[async_trait]
    impl RestartHandler for AlwaysRestart {
        async fn restart(&self, _worker_id: WorkerId) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn first_heartbeat_auto_registers_worker() {
        let hm = HealthMonitor::new(config(), EventPlane::new("controller", 16));
        let worker_id = WorkerId::new();
        hm.record_heartbeat(
            &Heartbeat {
                worker_id,
                timestamp_epoch: 0,
                status: controller_common::types::WorkerStatus::Idle,
                current_task: None,
                memory_bytes: 0,
                cpu_ratio: None,
                progress: None,
            },
            0,
        );
        let health = hm.get_worker_health(worker_id).unwrap();
        assert_eq!(health.health_status, HealthStatus::Healthy);
        assert_eq!(health.missed_heartbeats, 0);
    }

    #[tokio::test]
    async fn stale_worker_is_marked_zombie_and_restarted() {
        let hm = HealthMonitor::new(config(), EventPlane::new("controller", 16));
        let worker_id = WorkerId::new();
        hm.record_heartbeat(
            &Heartbeat {
                worker_id,
                timestamp_epoch: 0,
                status: controller_common::types::WorkerStatus::Working,
                current_task: Some(ItemId::from("A")),
                memory_bytes: 0,
                cpu_ratio: None,
                progress: None,
            },
            0,
        );

        hm.sweep(10_000, |_| Some(ItemId::from("A")), &NoopReassign, &AlwaysRestart)
            .await;

        let health = hm.get_worker_health(worker_id).unwrap();
        assert_eq!(health.health_status, HealthStatus::Healthy);
        assert_eq!(health.restart_attempts, 1);
    }

    #[tokio::test]
    async fn degraded_fires_at_half_missed_heartbeat_budget_not_after_one_interval() {
        let hm = HealthMonitor::new(config(), EventPlane::new("controller", 16));
        let worker_id = WorkerId::new();
        hm.record_heartbeat(
            &Heartbeat {
                worker_id,
                timestamp_epoch: 0,
                status: controller_common::types::WorkerStatus::Idle,
                current_task: None,
                memory_bytes: 0,
                cpu_ratio: None,
                progress: None,
            },
            0,
        );

        // One interval late (1200ms, threshold=3) is not yet degraded under
        // the missed_heartbeat_threshold/2 rule (1500ms).
        hm.sweep(1200, |_| None, &NoopReassign, &AlwaysRestart).await;
        assert_eq!(hm.get_worker_health(worker_id).unwrap().health_status, HealthStatus::Healthy);

        hm.sweep(1600, |_| None, &NoopReassign, &AlwaysRestart).await;
        assert_eq!(hm.get_worker_health(worker_id).unwrap().health_status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn stray_heartbeat_does_not_clear_zombie_status() {
        let mut cfg = config();
        cfg.restart_cooldown_ms = 1_000_000;
        let hm = HealthMonitor::new(cfg, EventPlane::new("controller", 16));
        let worker_id = WorkerId::new();
        let hb = Heartbeat {
            worker_id,
            timestamp_epoch: 0,
            status: controller_common::types::WorkerStatus::Working,
            current_task: Some(ItemId::from("A")),
            memory_bytes: 0,
            cpu_ratio: None,
            progress: None,
        };
        hm.record_heartbeat(&hb, 0);

        hm.sweep(10_000, |_| Some(ItemId::from("A")), &NoopReassign, &AlwaysRestart)
            .await;
        assert_eq!(hm.get_worker_health(worker_id).unwrap().health_status, HealthStatus::Zombie);

        // A stray heartbeat arrives after the zombie declaration and a
        // restart attempt is still on cooldown; it must not silently
        // resolve the zombie status back to healthy.
        hm.record_heartbeat(&hb, 10_000);
        assert_eq!(hm.get_worker_health(worker_id).unwrap().health_status, HealthStatus::Zombie);
    }

    #[tokio::test]
    async fn unknown_worker_query_errors() {
        let hm = HealthMonitor::new(config(), EventPlane::new("controller", 16));
        assert!(matches!(
            hm.get_worker_health(WorkerId::new()),
            Err(HealthError::UnknownWorker(_))
        ));
    }
}
