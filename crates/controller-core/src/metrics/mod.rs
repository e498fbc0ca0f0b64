//! Metrics / Event Plane (MEP)
//!
//! Two independent surfaces share this module: Prometheus-style gauges and
//! counters recorded through the `metrics` facade (rendered by whichever
//! recorder `main` installs), and a typed event broadcast channel that the
//! other five components publish to. A lagging subscriber is dropped
//! rather than allowed to slow down emission.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use controller_common::types::ControllerEvent;
use tokio::sync::broadcast;

/// Running counters mirrored alongside the `metrics` crate calls so
/// `snapshot_json()` can answer without depending on a specific recorder's
/// read-back API (Prometheus text rendering is write-only from here).
#[derive(Default)]
struct Counters {
    tasks_enqueued: AtomicU64,
    tasks_dequeued: AtomicU64,
    tasks_rejected: AtomicU64,
    tasks_dropped: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    zombies_detected: AtomicU64,
    workers_restarted: AtomicU64,
    recovery_attempts: AtomicU64,
    critical_escalations: AtomicU64,
    subscribers_dropped: AtomicU64,
    queue_depth: AtomicI64,
    backpressure_active: AtomicI64,
}

/// The Metrics/Event Plane. Cheap to clone (`Arc` inside); every component
/// holds one and calls `record_event` as the final step of its own state
/// transition, after releasing its own lock — this component sits above
/// every other one in lock acquisition order.
#[derive(Clone)]
pub struct EventPlane {
    prefix: String,
    sender: broadcast::Sender<ControllerEvent>,
    counters: Arc<Counters>,
}

impl EventPlane {
    pub fn new(prefix: impl Into<String>, buffer_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_capacity);
        Self {
            prefix: prefix.into(),
            sender,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Subscribe to the event stream. Each subscriber gets its own ring
    /// buffer of `buffer_capacity`; falling behind drops the oldest
    /// messages and the subscriber observes `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.sender.subscribe()
    }

    /// Publish an event and update the matching Prometheus counter/gauge.
    /// Never blocks: `broadcast::Sender::send` only fails when there are no
    /// subscribers, which is a normal and ignorable condition here.
    pub fn record_event(&self, event: ControllerEvent) {
        self.bump_counters(&event);
        if self.sender.send(event).is_err() {
            tracing::trace!("event published with no active subscribers");
        }
    }

    fn bump_counters(&self, event: &ControllerEvent) {
        use ControllerEvent::*;
        let p = &self.prefix;
        match event {
            TaskEnqueued { .. } => {
                self.counters.tasks_enqueued.fetch_add(1, Ordering::Relaxed);
                self.counters.queue_depth.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(format!("{p}_tasks_enqueued_total")).increment(1);
            }
            TaskDequeued { .. } => {
                self.counters.tasks_dequeued.fetch_add(1, Ordering::Relaxed);
                self.counters.queue_depth.fetch_sub(1, Ordering::Relaxed);
                metrics::counter!(format!("{p}_tasks_dequeued_total")).increment(1);
            }
            TaskRejected { .. } => {
                self.counters.tasks_rejected.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(format!("{p}_tasks_rejected_total")).increment(1);
            }
            TaskDropped { .. } => {
                self.counters.tasks_dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(format!("{p}_tasks_dropped_total")).increment(1);
            }
            BackpressureActivated => {
                self.counters.backpressure_active.store(1, Ordering::Relaxed);
                metrics::gauge!(format!("{p}_backpressure_active")).set(1.0);
            }
            BackpressureReleased => {
                self.counters.backpressure_active.store(0, Ordering::Relaxed);
                metrics::gauge!(format!("{p}_backpressure_active")).set(0.0);
            }
            SoftLimitWarning => {
                metrics::counter!(format!("{p}_soft_limit_warnings_total")).increment(1);
            }
            TaskStarted { .. } => {
                metrics::counter!(format!("{p}_tasks_started_total")).increment(1);
            }
            TaskCompleted { .. } => {
                self.counters.tasks_completed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(format!("{p}_tasks_completed_total")).increment(1);
                self.publish_success_rate();
            }
            TaskFailed { .. } => {
                self.counters.tasks_failed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(format!("{p}_tasks_failed_total")).increment(1);
                self.publish_success_rate();
            }
            HeartbeatReceived { .. } => {
                metrics::counter!(format!("{p}_heartbeats_total")).increment(1);
            }
            ZombieDetected { .. } => {
                self.counters.zombies_detected.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(format!("{p}_zombies_detected_total")).increment(1);
            }
            WorkerRestarted { .. } => {
                self.counters.workers_restarted.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(format!("{p}_workers_restarted_total")).increment(1);
            }
            WorkerRestartFailed { .. } => {
                metrics::counter!(format!("{p}_worker_restart_failures_total")).increment(1);
            }
            TaskReassigned { .. } => {
                metrics::counter!(format!("{p}_tasks_reassigned_total")).increment(1);
            }
            MemoryThresholdExceeded { .. } => {
                metrics::counter!(format!("{p}_memory_threshold_exceeded_total")).increment(1);
            }
            RecoveryAttempted { .. } => {
                self.counters.recovery_attempts.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(format!("{p}_recovery_attempts_total")).increment(1);
            }
            RecoverySucceeded { .. } => {
                metrics::counter!(format!("{p}_recovery_succeeded_total")).increment(1);
            }
            RecoveryFailed { .. } => {
                metrics::counter!(format!("{p}_recovery_failed_total")).increment(1);
            }
            CriticalEscalation { .. } => {
                self.counters.critical_escalations.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(format!("{p}_critical_escalations_total")).increment(1);
            }
            PipelinePaused { .. } => {
                metrics::counter!(format!("{p}_pipeline_pauses_total")).increment(1);
            }
            SubscriberDropped { .. } => {
                self.counters.subscribers_dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(format!("{p}_subscribers_dropped_total")).increment(1);
            }
        }
    }

    pub fn record_queue_size(&self, size: usize, max_size: usize, utilization_ratio: f64) {
        let p = &self.prefix;
        metrics::gauge!(format!("{p}_queue_depth")).set(size as f64);
        metrics::gauge!(format!("{p}_queue_max_capacity")).set(max_size as f64);
        metrics::gauge!(format!("{p}_utilization_ratio")).set(utilization_ratio);
    }

    pub fn record_dead_letter_size(&self, size: usize) {
        metrics::gauge!(format!("{}_dead_letter_queue_size", self.prefix)).set(size as f64);
    }

    /// `active` covers workers currently bound to an item; `idle` and
    /// `error` are the other two `WorkerStatus` states.
    pub fn record_pool_size(&self, total: usize, active: usize, idle: usize, error: usize) {
        let p = &self.prefix;
        metrics::gauge!(format!("{p}_workers_total")).set(total as f64);
        metrics::gauge!(format!("{p}_workers_active")).set(active as f64);
        metrics::gauge!(format!("{p}_workers_idle")).set(idle as f64);
        metrics::gauge!(format!("{p}_workers_error")).set(error as f64);
    }

    pub fn record_task_duration_ms(&self, millis: f64) {
        metrics::histogram!(format!("{}_task_duration_ms", self.prefix)).record(millis);
    }

    fn publish_success_rate(&self) {
        let completed = self.counters.tasks_completed.load(Ordering::Relaxed) as f64;
        let failed = self.counters.tasks_failed.load(Ordering::Relaxed) as f64;
        let total = completed + failed;
        let rate = if total > 0.0 { completed / total } else { 1.0 };
        metrics::gauge!(format!("{}_task_success_rate", self.prefix)).set(rate);
    }

    /// JSON snapshot of the running counters. Not a substitute
    /// for the Prometheus text export — just a cheaper read for `/status`.
    pub fn snapshot_json(&self) -> serde_json::Value {
        serde_json::json!({
            "tasks_enqueued": self.counters.tasks_enqueued.load(Ordering::Relaxed),
            "tasks_dequeued": self.counters.tasks_dequeued.load(Ordering::Relaxed),
            "tasks_rejected": self.counters.tasks_rejected.load(Ordering::Relaxed),
            "tasks_dropped": self.counters.tasks_dropped.load(Ordering::Relaxed),
            "tasks_completed": self.counters.tasks_completed.load(Ordering::Relaxed),
            "tasks_failed": self.counters.tasks_failed.load(Ordering::Relaxed),
            "zombies_detected": self.counters.zombies_detected.load(Ordering::Relaxed),
            "workers_restarted": self.counters.workers_restarted.load(Ordering::Relaxed),
            "recovery_attempts": self.counters.recovery_attempts.load(Ordering::Relaxed),
            "critical_escalations": self.counters.critical_escalations.load(Ordering::Relaxed),
            "subscribers_dropped": self.counters.subscribers_dropped.load(Ordering::Relaxed),
            "queue_depth": self.counters.queue_depth.load(Ordering::Relaxed),
            "backpressure_active": self.counters.backpressure_active.load(Ordering::Relaxed) != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use controller_common::ids::ItemId;

    #[test]
    fn counters_track_emitted_events() {
        let plane = EventPlane::new("controller", 16);
        plane.record_event(ControllerEvent::TaskEnqueued {
            item_id: ItemId::from("A"),
        });
        plane.record_event(ControllerEvent::TaskDequeued {
            item_id: ItemId::from("A"),
        });
        let snapshot = plane.snapshot_json();
        assert_eq!(snapshot["tasks_enqueued"], 1);
        assert_eq!(snapshot["tasks_dequeued"], 1);
        assert_eq!(snapshot["queue_depth"], 0);
    }

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let plane = EventPlane::new("controller", 16);
        let mut rx = plane.subscribe();
        plane.record_event(ControllerEvent::SoftLimitWarning);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ControllerEvent::SoftLimitWarning));
    }
}
