use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use controller_common::config::PoolConfig;
use controller_common::ids::{ItemId, WorkerId};
use controller_common::types::{
    ControllerEvent, DependencyGraph, Heartbeat, Priority, WorkerSlot, WorkerStatus,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::checkpoint::CheckpointStore;
use crate::health::{self, HealthMonitor};
use crate::metrics::EventPlane;
use crate::priority::PriorityAnalyzer;
use crate::queue::BoundedWorkQueue;
use crate::stuck::{self, StuckWorkerHandler};

/// Result of running one item to completion. The pool never inspects the
/// task's actual output — only whether it should requeue, dead-letter, or
/// move the item on.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Completed,
    Failed { error: String, retryable: bool },
}

/// The unit of work a bound worker actually runs. Supplied by whatever
/// wires this pool together (typically a pipeline stage runner); this
/// crate only knows how to dispatch to it and interpret the outcome.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, item_id: &ItemId) -> ExecutionOutcome;
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

struct SlotHandle {
    slot: WorkerSlot,
    started_at_epoch: Option<i64>,
}

/// The Worker Pool Manager. One fixed-size pool of async worker loops,
/// each bound to at most one item at a time: a worker with
/// `status = working` always has exactly one `current_item`, and vice
/// versa. Owns the background health-sweep and stuck-escalation loops as
/// well, since both need direct access to worker state.
pub struct WorkerPoolManager {
    config: PoolConfig,
    queue: Arc<BoundedWorkQueue>,
    events: EventPlane,
    health: Arc<HealthMonitor>,
    stuck: Arc<StuckWorkerHandler>,
    checkpoints: Arc<CheckpointStore>,
    executor: Arc<dyn Executor>,
    analyzer: Arc<Mutex<PriorityAnalyzer>>,
    slots: Arc<Mutex<HashMap<WorkerId, SlotHandle>>>,
    handles: Mutex<HashMap<WorkerId, JoinHandle<()>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    submissions_paused: Arc<AtomicBool>,
    /// Set once by `start()` so `restart()` can respawn a worker loop from
    /// a `&self` method without reconstructing ownership unsafely.
    self_weak: Mutex<Option<std::sync::Weak<WorkerPoolManager>>>,
}

impl WorkerPoolManager {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        config: PoolConfig,
        queue: Arc<BoundedWorkQueue>,
        events: EventPlane,
        health: Arc<HealthMonitor>,
        stuck: Arc<StuckWorkerHandler>,
        checkpoints: Arc<CheckpointStore>,
        executor: Arc<dyn Executor>,
        analyzer: Arc<Mutex<PriorityAnalyzer>>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let pool = Arc::new(Self {
            config,
            queue,
            events,
            health,
            stuck,
            checkpoints,
            executor,
            analyzer,
            slots: Arc::new(Mutex::new(HashMap::new())),
            handles: Mutex::new(HashMap::new()),
            background: Mutex::new(Vec::new()),
            shutdown_tx,
            submissions_paused: Arc::new(AtomicBool::new(false)),
            self_weak: Mutex::new(None),
        });
        *pool.self_weak.lock().unwrap() = Some(Arc::downgrade(&pool));

        for _ in 0..pool.config.num_workers {
            pool.spawn_worker();
        }

        {
            let background_pool = Arc::clone(&pool);
            let handle = tokio::spawn(async move { background_pool.health_sweep_loop().await });
            pool.background.lock().unwrap().push(handle);
        }
        {
            let background_pool = Arc::clone(&pool);
            let handle = tokio::spawn(async move { background_pool.stuck_check_loop().await });
            pool.background.lock().unwrap().push(handle);
        }

        tracing::info!(num_workers = pool.config.num_workers, "worker pool started");
        pool
    }

    fn spawn_worker(self: &Arc<Self>) {
        let worker_id = WorkerId::new();
        self.slots.lock().unwrap().insert(
            worker_id,
            SlotHandle {
                slot: WorkerSlot::new(worker_id),
                started_at_epoch: None,
            },
        );
        let pool = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move { pool.worker_loop(worker_id, &mut shutdown_rx).await });
        self.handles.lock().unwrap().insert(worker_id, handle);
    }

    async fn worker_loop(self: Arc<Self>, worker_id: WorkerId, shutdown_rx: &mut watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let item_id = match self.queue.dequeue() {
                Some(item) => item,
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => continue,
                        _ = shutdown_rx.changed() => continue,
                    }
                }
            };

            self.bind(worker_id, item_id.clone());
            self.events.record_event(ControllerEvent::TaskStarted {
                worker_id,
                item_id: item_id.clone(),
            });

            let (hb_cancel_tx, hb_cancel_rx) = tokio::sync::oneshot::channel::<()>();
            let hb_handle = tokio::spawn(Self::heartbeat_task(
                Arc::clone(&self.health),
                worker_id,
                item_id.clone(),
                hb_cancel_rx,
            ));

            let dispatch_started = std::time::Instant::now();
            let outcome = self.executor.execute(&item_id).await;
            self.events
                .record_task_duration_ms(dispatch_started.elapsed().as_secs_f64() * 1000.0);

            let _ = hb_cancel_tx.send(());
            let _ = hb_handle.await;

            self.unbind(worker_id);
            self.stuck.clear(worker_id, &item_id);

            match outcome {
                ExecutionOutcome::Completed => {
                    self.events.record_event(ControllerEvent::TaskCompleted {
                        worker_id,
                        item_id: item_id.clone(),
                    });
                    self.on_item_completed(item_id).await;
                }
                ExecutionOutcome::Failed { error, retryable } => {
                    self.events.record_event(ControllerEvent::TaskFailed {
                        worker_id,
                        item_id: item_id.clone(),
                        error,
                    });
                    if retryable {
                        self.queue.enqueue(item_id, Priority::P1, 1, now_ms()).await;
                    }
                }
            }
        }

        tracing::info!(worker_id = %worker_id, "worker loop exited");
    }

    async fn heartbeat_task(
        health: Arc<HealthMonitor>,
        worker_id: WorkerId,
        item_id: ItemId,
        mut cancel: tokio::sync::oneshot::Receiver<()>,
    ) {
        let interval = std::time::Duration::from_millis(500);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    health.record_heartbeat(
                        &Heartbeat {
                            worker_id,
                            timestamp_epoch: now_ms(),
                            status: WorkerStatus::Working,
                            current_task: Some(item_id.clone()),
                            memory_bytes: 0,
                            cpu_ratio: None,
                            progress: None,
                        },
                        now_ms(),
                    );
                }
                _ = &mut cancel => break,
            }
        }
    }

    fn bind(&self, worker_id: WorkerId, item_id: ItemId) {
        {
            let mut slots = self.slots.lock().unwrap();
            if let Some(handle) = slots.get_mut(&worker_id) {
                handle.slot.status = WorkerStatus::Working;
                handle.slot.current_item = Some(item_id);
                handle.slot.started_at_epoch = Some(now_ms());
                handle.started_at_epoch = Some(now_ms());
            }
        }
        self.publish_pool_size();
    }

    fn unbind(&self, worker_id: WorkerId) {
        {
            let mut slots = self.slots.lock().unwrap();
            if let Some(handle) = slots.get_mut(&worker_id) {
                handle.slot.status = WorkerStatus::Idle;
                handle.slot.current_item = None;
                handle.slot.started_at_epoch = None;
                handle.slot.completed_count += 1;
                handle.started_at_epoch = None;
            }
        }
        self.publish_pool_size();
    }

    fn publish_pool_size(&self) {
        let slots = self.slots.lock().unwrap();
        let mut active = 0;
        let mut idle = 0;
        let mut error = 0;
        for handle in slots.values() {
            match handle.slot.status {
                WorkerStatus::Working => active += 1,
                WorkerStatus::Idle => idle += 1,
                WorkerStatus::Error => error += 1,
            }
        }
        self.events.record_pool_size(slots.len(), active, idle, error);
    }

    async fn health_sweep_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = std::time::Duration::from_millis(500);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => break,
            }
            if *shutdown_rx.borrow() {
                break;
            }
            let current_items: HashMap<WorkerId, Option<ItemId>> = {
                let slots = self.slots.lock().unwrap();
                slots.iter().map(|(id, h)| (*id, h.slot.current_item.clone())).collect()
            };
            self.health
                .sweep(
                    now_ms(),
                    |worker_id| current_items.get(&worker_id).cloned().flatten(),
                    self.as_ref(),
                    self.as_ref(),
                )
                .await;
        }
    }

    async fn stuck_check_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = std::time::Duration::from_millis(500);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => break,
            }
            if *shutdown_rx.borrow() {
                break;
            }
            let bound: Vec<(WorkerId, ItemId, i64)> = {
                let slots = self.slots.lock().unwrap();
                slots
                    .iter()
                    .filter_map(|(id, h)| {
                        let item = h.slot.current_item.clone()?;
                        let started = h.started_at_epoch?;
                        Some((*id, item, started))
                    })
                    .collect()
            };
            let now = now_ms();
            for (worker_id, item_id, started_at) in bound {
                self.stuck
                    .check(
                        worker_id,
                        item_id,
                        started_at,
                        now,
                        self.as_ref(),
                        self.as_ref(),
                        self.as_ref(),
                        self.as_ref(),
                    )
                    .await;
            }
        }
    }

    pub fn get_status(&self) -> Vec<WorkerSlot> {
        self.slots.lock().unwrap().values().map(|h| h.slot.clone()).collect()
    }

    pub fn get_worker(&self, worker_id: WorkerId) -> Option<WorkerSlot> {
        self.slots.lock().unwrap().get(&worker_id).map(|h| h.slot.clone())
    }

    pub fn get_queue(&self) -> Arc<BoundedWorkQueue> {
        Arc::clone(&self.queue)
    }

    pub fn get_checkpoints(&self) -> Arc<CheckpointStore> {
        Arc::clone(&self.checkpoints)
    }

    pub fn get_analyzer(&self) -> Arc<Mutex<PriorityAnalyzer>> {
        Arc::clone(&self.analyzer)
    }

    /// Submit an item for execution. Refuses new submissions once the
    /// pipeline has been paused by a critical stuck-worker escalation,
    /// while leaving in-flight executors to run to completion.
    pub async fn submit(&self, item_id: ItemId, priority: Priority, effort: u32) -> bool {
        if self.submissions_paused.load(Ordering::Acquire) {
            self.events.record_event(ControllerEvent::TaskRejected {
                item_id,
                reason: "pipeline paused".to_string(),
            });
            return false;
        }
        self.queue.enqueue(item_id, priority, effort, now_ms()).await.success
    }

    /// Analyze `graph` and submit whatever it currently makes executable.
    /// Returns the ids actually submitted; the analyzer keeps the rest of
    /// the graph cached so completions can unlock later layers.
    pub async fn submit_graph(&self, graph: &DependencyGraph) -> Result<Vec<ItemId>, String> {
        let ready = {
            let mut analyzer = self.analyzer.lock().unwrap();
            analyzer.analyze(graph).map_err(|e| e.to_string())?;
            analyzer.get_executable_items().map_err(|e| e.to_string())?
        };
        Ok(self.dispatch_ready_items(ready).await)
    }

    /// Submit every item in `ready`, marking each as in-progress in the
    /// analyzer once its submission succeeds. Returns the ids actually
    /// submitted.
    async fn dispatch_ready_items(&self, ready: Vec<ItemId>) -> Vec<ItemId> {
        let mut dispatched = Vec::new();
        for item_id in ready {
            let item = {
                let analyzer = self.analyzer.lock().unwrap();
                match analyzer.get_item(&item_id) {
                    Ok(item) => item,
                    Err(_) => continue,
                }
            };
            if self.submit(item_id.clone(), item.priority, item.effort).await {
                self.analyzer.lock().unwrap().mark_in_progress(&item_id).ok();
                dispatched.push(item_id);
            }
        }
        dispatched
    }

    /// Tell the analyzer `item_id` finished, then submit whatever newly
    /// became executable as a result. A no-op if no analysis has run, or
    /// the item isn't tracked (items submitted directly via `submit`
    /// rather than `submit_graph` aren't known to the analyzer).
    async fn on_item_completed(&self, item_id: ItemId) {
        let ready = {
            let mut analyzer = self.analyzer.lock().unwrap();
            if analyzer.mark_completed(&item_id).is_err() {
                return;
            }
            match analyzer.get_executable_items() {
                Ok(ready) => ready,
                Err(_) => return,
            }
        };
        self.dispatch_ready_items(ready).await;
    }

    /// Signal every worker loop and background task to stop.
    /// `graceful = true` waits up to `graceful_stop_ms` for in-flight
    /// executors to finish before the handles are dropped (not aborted —
    /// letting them run past the window rather than killing mid-write).
    pub async fn stop(&self, graceful: bool) {
        let _ = self.shutdown_tx.send(true);
        if graceful {
            tokio::time::sleep(std::time::Duration::from_millis(self.config.graceful_stop_ms)).await;
        }
        tracing::info!(graceful, "worker pool stop signaled");
    }
}

#[async_trait]
impl health::ReassignmentHandler for WorkerPoolManager {
    async fn reassign(&self, worker_id: WorkerId, item_id: Option<ItemId>) {
        if let Some(item_id) = item_id {
            self.queue.enqueue(item_id, Priority::P1, 1, now_ms()).await;
        }
        self.unbind(worker_id);
    }
}

#[async_trait]
impl health::RestartHandler for WorkerPoolManager {
    async fn restart(&self, worker_id: WorkerId) -> bool {
        let old_handle = self.handles.lock().unwrap().remove(&worker_id);
        if let Some(handle) = old_handle {
            handle.abort();
        }
        {
            let mut slots = self.slots.lock().unwrap();
            if let Some(entry) = slots.get_mut(&worker_id) {
                entry.slot.status = WorkerStatus::Idle;
                entry.slot.current_item = None;
                entry.slot.restart_count += 1;
                entry.slot.last_restart_epoch = Some(now_ms());
                entry.started_at_epoch = None;
            } else {
                return false;
            }
        }
        self.respawn(worker_id);
        true
    }
}

impl WorkerPoolManager {
    /// `restart` only has `&self`, so the replacement loop is spawned
    /// against the `Weak` handle `start()` stashed — every caller of
    /// `restart` reaches it through an `Arc<WorkerPoolManager>` already,
    /// so the upgrade can only fail if the pool itself is being dropped.
    fn respawn(&self, worker_id: WorkerId) {
        let Some(pool) = self.self_weak.lock().unwrap().as_ref().and_then(|w| w.upgrade()) else {
            return;
        };
        let mut shutdown_rx = pool.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move { pool.worker_loop(worker_id, &mut shutdown_rx).await });
        self.handles.lock().unwrap().insert(worker_id, handle);
    }
}

#[async_trait]
impl stuck::DeadlineExtensionHandler for WorkerPoolManager {
    async fn extend_deadline(&self, worker_id: WorkerId, _item_id: ItemId, _extension_ms: u64) -> bool {
        let mut slots = self.slots.lock().unwrap();
        if let Some(entry) = slots.get_mut(&worker_id) {
            if let Some(started) = entry.started_at_epoch {
                entry.started_at_epoch = Some(started + _extension_ms as i64);
                entry.slot.started_at_epoch = entry.started_at_epoch;
                return true;
            }
        }
        false
    }
}

#[async_trait]
impl stuck::ReassignmentHandler for WorkerPoolManager {
    async fn reassign(&self, worker_id: WorkerId, item_id: ItemId) -> bool {
        let outcome = self.queue.enqueue(item_id, Priority::P1, 1, now_ms()).await;
        self.unbind(worker_id);
        outcome.success
    }
}

#[async_trait]
impl stuck::RestartHandler for WorkerPoolManager {
    async fn restart(&self, worker_id: WorkerId) -> bool {
        health::RestartHandler::restart(self, worker_id).await
    }
}

#[async_trait]
impl stuck::PipelinePauseHandler for WorkerPoolManager {
    async fn pause(&self, reason: String) {
        self.submissions_paused.store(true, Ordering::Release);
        tracing::warn!(reason = %reason, "pipeline paused after critical stuck-worker escalation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use controller_common::config::{CheckpointConfig, HealthConfig, QueueConfig, RejectionPolicy, StuckConfig};

    fn pool_config() -> PoolConfig {
        PoolConfig {
            num_workers: 1,
            graceful_stop_ms: 0,
        }
    }

    fn queue_config() -> QueueConfig {
        QueueConfig {
            max_size: 8,
            soft_limit_ratio: 0.75,
            backpressure_threshold: 0.9,
            max_backpressure_delay_ms: 0,
            max_memory_bytes: u64::MAX,
            rejection_policy: RejectionPolicy::Reject,
            enable_dead_letter: true,
            max_dead_letter_size: 16,
        }
    }

    fn health_config() -> HealthConfig {
        HealthConfig {
            heartbeat_interval_ms: 1000,
            health_check_interval_ms: 500,
            missed_heartbeat_threshold: 3,
            memory_threshold_bytes: u64::MAX,
            max_restarts: 2,
            restart_cooldown_ms: 0,
        }
    }

    fn stuck_config() -> StuckConfig {
        StuckConfig {
            warning_ms: 60_000,
            stuck_ms: 120_000,
            critical_ms: 300_000,
            deadline_extension_ms: 1000,
            max_recovery_attempts: 3,
            pause_on_critical: true,
        }
    }

    fn priority_config() -> controller_common::config::PriorityConfig {
        controller_common::config::PriorityConfig {
            weight_p0: 100.0,
            weight_p1: 75.0,
            weight_p2: 50.0,
            weight_p3: 25.0,
            dependents_bonus: 5.0,
            quick_win_threshold: 2,
            quick_win_bonus: 10.0,
            critical_path_bonus: 15.0,
        }
    }

    struct AlwaysComplete;
    #[async_trait]
    impl Executor for AlwaysComplete {
        async fn execute(&self, _item_id: &ItemId) -> ExecutionOutcome {
            ExecutionOutcome::Completed
        }
    }

    async fn start_pool(executor: Arc<dyn Executor>) -> (Arc<WorkerPoolManager>, tempfile::TempDir) {
        let events = EventPlane::new("controller", 64);
        let queue = Arc::new(BoundedWorkQueue::new(queue_config(), events.clone()));
        let health = Arc::new(HealthMonitor::new(health_config(), events.clone()));
        let stuck = Arc::new(StuckWorkerHandler::new(stuck_config(), events.clone()));
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = Arc::new(CheckpointStore::new(CheckpointConfig {
            base_dir: dir.path().to_string_lossy().to_string(),
        }));
        let analyzer = Arc::new(Mutex::new(PriorityAnalyzer::new(priority_config())));
        let pool = WorkerPoolManager::start(
            pool_config(),
            queue,
            events,
            health,
            stuck,
            checkpoints,
            executor,
            analyzer,
        );
        (pool, dir)
    }

    #[tokio::test]
    async fn submitted_item_completes_and_worker_returns_to_idle() {
        let (pool, _dir) = start_pool(Arc::new(AlwaysComplete)).await;

        assert!(pool.submit(ItemId::from("item-1"), Priority::P1, 1).await);

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        let statuses = pool.get_status();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status, WorkerStatus::Idle);
        assert_eq!(statuses[0].completed_count, 1);
        assert!(statuses[0].current_item.is_none());

        pool.stop(false).await;
    }

    #[tokio::test]
    async fn submit_is_refused_once_pipeline_paused() {
        let (pool, _dir) = start_pool(Arc::new(AlwaysComplete)).await;

        stuck::PipelinePauseHandler::pause(pool.as_ref(), "test".to_string()).await;

        let accepted = pool.submit(ItemId::from("item-1"), Priority::P1, 1).await;
        assert!(!accepted);

        pool.stop(false).await;
    }

    #[tokio::test]
    async fn dependent_item_is_submitted_once_its_dependency_completes() {
        use controller_common::types::{DependencyGraph, WorkItem};

        let (pool, _dir) = start_pool(Arc::new(AlwaysComplete)).await;

        let mut graph = DependencyGraph::with_nodes([
            WorkItem::new("A", Priority::P1, 1),
            WorkItem::new("B", Priority::P1, 1),
        ]);
        graph.add_edge("A", "B");

        let submitted = pool.submit_graph(&graph).await.unwrap();
        assert_eq!(submitted, vec![ItemId::from("A")]);

        tokio::time::sleep(std::time::Duration::from_millis(500)).await;

        let statuses = pool.get_status();
        assert_eq!(statuses.iter().map(|s| s.completed_count).sum::<u64>(), 2);

        pool.stop(false).await;
    }
}
