//! Bounded Work Queue (BWQ)
//!
//! An in-memory max-heap ordered `(priority desc, enqueued_at_epoch asc)`.
//! Enforces a hard capacity with a configurable admission
//! policy once full, applies backpressure as utilization approaches that
//! capacity, and routes anything it refuses to a bounded dead-letter
//! sideline instead of silently discarding it.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use controller_common::config::{QueueConfig, RejectionPolicy};
use controller_common::ids::ItemId;
use controller_common::types::{
    ControllerEvent, DeadLetterEntry, DeadLetterReason, EnqueueOutcome, Priority, QueueEntry,
    QueueStatus,
};

use crate::metrics::EventPlane;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("item {0} already queued")]
    Duplicate(ItemId),
    #[error("item {0} not found in queue")]
    NotFound(ItemId),
}

struct Inner {
    heap: BinaryHeap<QueueEntry>,
    members: HashMap<ItemId, u64>, // per-item effort, used for memory accounting
    dead_letter: VecDeque<DeadLetterEntry>,
    memory_usage: u64,
}

/// The Bounded Work Queue. Safe to share across tasks via `Arc`; all
/// mutation is behind a single `Mutex` held only for the duration of the
/// heap operation — backpressure sleeps happen outside the lock.
pub struct BoundedWorkQueue {
    config: QueueConfig,
    inner: Mutex<Inner>,
    events: EventPlane,
}

impl BoundedWorkQueue {
    pub fn new(config: QueueConfig, events: EventPlane) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                members: HashMap::new(),
                dead_letter: VecDeque::new(),
                memory_usage: 0,
            }),
            events,
        }
    }

    /// Admit `item_id` at `priority`/`effort`. May sleep (outside the lock)
    /// if the queue is within its backpressure band. Returns the outcome
    /// without erroring — rejection is a normal, observable result, not an
    /// exceptional one.
    pub async fn enqueue(
        &self,
        item_id: ItemId,
        priority: Priority,
        effort: u32,
        enqueued_at_epoch: i64,
    ) -> EnqueueOutcome {
        let delay = self.backpressure_delay();
        if delay > Duration::ZERO {
            self.events.record_event(ControllerEvent::BackpressureActivated);
            tokio::time::sleep(delay).await;
            self.events.record_event(ControllerEvent::BackpressureReleased);
        }

        let outcome = {
            let mut inner = self.inner.lock().unwrap();

            if inner.members.contains_key(&item_id) {
                return EnqueueOutcome::rejected("item already queued");
            }

            let item_bytes = estimate_item_bytes(effort);
            let at_capacity = inner.heap.len() >= self.config.max_size;
            let over_memory = inner.memory_usage + item_bytes > self.config.max_memory_bytes;

            if at_capacity || over_memory {
                match self.config.rejection_policy {
                    RejectionPolicy::Reject => {
                        return EnqueueOutcome::rejected(if over_memory {
                            "memory limit exceeded"
                        } else {
                            "queue at capacity"
                        });
                    }
                    RejectionPolicy::DropOldest => {
                        if let Some(victim) = pop_oldest(&mut inner.heap) {
                            self.dead_letter_locked(
                                &mut inner,
                                victim,
                                DeadLetterReason::DroppedForNewer,
                                enqueued_at_epoch,
                            );
                        } else {
                            return EnqueueOutcome::rejected("queue at capacity");
                        }
                    }
                    RejectionPolicy::DropLowestPriority => {
                        match pop_lowest_priority(&mut inner.heap) {
                            // Incoming item outranks the current lowest entry
                            // (lower ordinal = more urgent): evict the victim.
                            Some(victim) if priority < victim.priority => {
                                self.dead_letter_locked(
                                    &mut inner,
                                    victim,
                                    DeadLetterReason::LowerPriorityThanQueue,
                                    enqueued_at_epoch,
                                );
                            }
                            // Incoming item is no more urgent than the queue's
                            // current lowest entry: put it back and refuse.
                            Some(victim) => {
                                inner.heap.push(victim);
                                return EnqueueOutcome::rejected(
                                    "no lower-priority item to evict",
                                );
                            }
                            None => {
                                return EnqueueOutcome::rejected("queue at capacity");
                            }
                        }
                    }
                }
            }

            inner.heap.push(QueueEntry {
                item_id: item_id.clone(),
                priority,
                effort,
                enqueued_at_epoch,
            });
            inner.members.insert(item_id.clone(), item_bytes);
            inner.memory_usage += item_bytes;

            let soft_limit = (self.config.max_size as f64 * self.config.soft_limit_ratio) as usize;
            let warn = inner.heap.len() >= soft_limit;
            (EnqueueOutcome::ok(), warn)
        };

        let (outcome, soft_limit_warning) = outcome;
        self.events.record_event(ControllerEvent::TaskEnqueued {
            item_id: item_id.clone(),
        });
        if soft_limit_warning {
            self.events.record_event(ControllerEvent::SoftLimitWarning);
        }
        self.publish_size();
        outcome
    }

    /// Pop the highest-priority, earliest-enqueued item.
    pub fn dequeue(&self) -> Option<ItemId> {
        let item_id = {
            let mut inner = self.inner.lock().unwrap();
            let entry = inner.heap.pop()?;
            let bytes = inner.members.remove(&entry.item_id).unwrap_or(0);
            inner.memory_usage = inner.memory_usage.saturating_sub(bytes);
            entry.item_id
        };
        self.events.record_event(ControllerEvent::TaskDequeued {
            item_id: item_id.clone(),
        });
        self.publish_size();
        Some(item_id)
    }

    pub fn has(&self, item_id: &ItemId) -> bool {
        self.inner.lock().unwrap().members.contains_key(item_id)
    }

    /// Remove a specific item without dispatching it (e.g. cancellation).
    pub fn remove(&self, item_id: &ItemId) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.members.contains_key(item_id) {
            return Err(QueueError::NotFound(item_id.clone()));
        }
        let remaining: BinaryHeap<QueueEntry> = inner
            .heap
            .drain()
            .filter(|e| &e.item_id != item_id)
            .collect();
        inner.heap = remaining;
        let bytes = inner.members.remove(item_id).unwrap_or(0);
        inner.memory_usage = inner.memory_usage.saturating_sub(bytes);
        Ok(())
    }

    pub fn get_all(&self) -> Vec<ItemId> {
        let inner = self.inner.lock().unwrap();
        inner.heap.iter().map(|e| e.item_id.clone()).collect()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.heap.clear();
        inner.members.clear();
        inner.memory_usage = 0;
    }

    pub fn get_dead_letter_queue(&self) -> Vec<DeadLetterEntry> {
        self.inner.lock().unwrap().dead_letter.iter().cloned().collect()
    }

    /// Re-admit a dead-lettered item at the front of its priority band.
    /// Subject to the same admission rules as a fresh `enqueue`.
    pub async fn retry_from_dead_letter(&self, item_id: &ItemId) -> Result<EnqueueOutcome, QueueError> {
        let entry = {
            let mut inner = self.inner.lock().unwrap();
            let pos = inner
                .dead_letter
                .iter()
                .position(|e| &e.item_id == item_id)
                .ok_or_else(|| QueueError::NotFound(item_id.clone()))?;
            let entry = inner.dead_letter.remove(pos).unwrap();
            self.events.record_dead_letter_size(inner.dead_letter.len());
            entry
        };
        Ok(self
            .enqueue(entry.item_id, entry.priority, entry.effort, entry.enqueued_at_epoch)
            .await)
    }

    pub fn get_status(&self) -> QueueStatus {
        let inner = self.inner.lock().unwrap();
        let size = inner.heap.len();
        let utilization_ratio = size as f64 / self.config.max_size as f64;
        let soft_limit = (self.config.max_size as f64 * self.config.soft_limit_ratio) as usize;
        QueueStatus {
            size,
            max_size: self.config.max_size,
            utilization_ratio,
            backpressure_active: utilization_ratio >= self.config.backpressure_threshold,
            soft_limit_warning: size >= soft_limit,
            memory_usage: inner.memory_usage,
        }
    }

    /// Linear delay scaled by how far utilization sits inside the
    /// backpressure band, capped at `max_backpressure_delay_ms`.
    fn backpressure_delay(&self) -> Duration {
        let status = self.get_status();
        if status.utilization_ratio < self.config.backpressure_threshold {
            return Duration::ZERO;
        }
        let band = (1.0 - self.config.backpressure_threshold).max(f64::EPSILON);
        let progress = ((status.utilization_ratio - self.config.backpressure_threshold) / band).min(1.0);
        let millis = (progress * self.config.max_backpressure_delay_ms as f64) as u64;
        Duration::from_millis(millis)
    }

    fn dead_letter_locked(
        &self,
        inner: &mut Inner,
        entry: QueueEntry,
        reason: DeadLetterReason,
        now_epoch: i64,
    ) {
        inner.members.remove(&entry.item_id);
        if !self.config.enable_dead_letter {
            self.events.record_event(ControllerEvent::TaskDropped {
                item_id: entry.item_id,
                reason,
            });
            return;
        }
        if inner.dead_letter.len() >= self.config.max_dead_letter_size {
            inner.dead_letter.pop_front();
        }
        inner.dead_letter.push_back(DeadLetterEntry {
            item_id: entry.item_id.clone(),
            priority: entry.priority,
            effort: entry.effort,
            enqueued_at_epoch: entry.enqueued_at_epoch,
            reason,
            dropped_at_epoch: now_epoch,
        });
        self.events.record_dead_letter_size(inner.dead_letter.len());
        self.events.record_event(ControllerEvent::TaskDropped {
            item_id: entry.item_id,
            reason,
        });
    }

    fn publish_size(&self) {
        let status = self.get_status();
        self.events
            .record_queue_size(status.size, status.max_size, status.utilization_ratio);
    }
}

fn pop_oldest(heap: &mut BinaryHeap<QueueEntry>) -> Option<QueueEntry> {
    if heap.is_empty() {
        return None;
    }
    let drained: Vec<QueueEntry> = heap.drain().collect();
    let (oldest_idx, _) = drained
        .iter()
        .enumerate()
        .min_by_key(|(_, e)| e.enqueued_at_epoch)?;
    let mut drained = drained;
    let victim = drained.remove(oldest_idx);
    heap.extend(drained);
    Some(victim)
}

fn pop_lowest_priority(heap: &mut BinaryHeap<QueueEntry>) -> Option<QueueEntry> {
    if heap.is_empty() {
        return None;
    }
    let drained: Vec<QueueEntry> = heap.drain().collect();
    let (worst_idx, _) = drained
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| b.enqueued_at_epoch.cmp(&a.enqueued_at_epoch))
        })?;
    let mut drained = drained;
    let victim = drained.remove(worst_idx);
    heap.extend(drained);
    Some(victim)
}

fn estimate_item_bytes(effort: u32) -> u64 {
    // Flat per-item overhead plus a rough per-effort-unit scaling factor;
    // memory accounting only needs to be monotonic, not exact.
    256 + effort as u64 * 64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> QueueConfig {
        QueueConfig {
            max_size: 4,
            soft_limit_ratio: 0.75,
            backpressure_threshold: 0.9,
            max_backpressure_delay_ms: 0,
            max_memory_bytes: u64::MAX,
            rejection_policy: RejectionPolicy::Reject,
            enable_dead_letter: true,
            max_dead_letter_size: 16,
        }
    }

    fn plane() -> EventPlane {
        EventPlane::new("controller", 64)
    }

    #[tokio::test]
    async fn priority_then_fifo_ordering() {
        // Scenario: same-priority items dequeue oldest-first; higher
        // priority always dequeues before lower regardless of age.
        let queue = BoundedWorkQueue::new(config(), plane());
        queue.enqueue(ItemId::from("low-old"), Priority::P2, 1, 1).await;
        queue.enqueue(ItemId::from("high"), Priority::P0, 1, 2).await;
        queue.enqueue(ItemId::from("low-new"), Priority::P2, 1, 3).await;

        assert_eq!(queue.dequeue(), Some(ItemId::from("high")));
        assert_eq!(queue.dequeue(), Some(ItemId::from("low-old")));
        assert_eq!(queue.dequeue(), Some(ItemId::from("low-new")));
    }

    #[tokio::test]
    async fn reject_policy_refuses_when_full() {
        let mut cfg = config();
        cfg.rejection_policy = RejectionPolicy::Reject;
        let queue = BoundedWorkQueue::new(cfg, plane());
        for i in 0..4 {
            let outcome = queue
                .enqueue(ItemId::from(format!("t{i}")), Priority::P1, 1, i as i64)
                .await;
            assert!(outcome.success);
        }
        let outcome = queue.enqueue(ItemId::from("overflow"), Priority::P1, 1, 99).await;
        assert!(!outcome.success);
        assert!(queue.get_dead_letter_queue().is_empty());
    }

    #[tokio::test]
    async fn drop_oldest_policy_dead_letters_the_victim() {
        let mut cfg = config();
        cfg.rejection_policy = RejectionPolicy::DropOldest;
        let queue = BoundedWorkQueue::new(cfg, plane());
        for i in 0..4 {
            queue
                .enqueue(ItemId::from(format!("t{i}")), Priority::P1, 1, i as i64)
                .await;
        }
        queue.enqueue(ItemId::from("newcomer"), Priority::P1, 1, 100).await;

        let dlq = queue.get_dead_letter_queue();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].item_id, ItemId::from("t0"));
        assert_eq!(dlq[0].reason, DeadLetterReason::DroppedForNewer);
        assert!(queue.has(&ItemId::from("newcomer")));
    }

    #[tokio::test]
    async fn drop_lowest_priority_evicts_a_less_urgent_victim() {
        let mut cfg = config();
        cfg.rejection_policy = RejectionPolicy::DropLowestPriority;
        let queue = BoundedWorkQueue::new(cfg, plane());
        for i in 0..4 {
            queue
                .enqueue(ItemId::from(format!("p1-{i}")), Priority::P1, 1, i as i64)
                .await;
        }

        // Queue is full of P1 items; a more urgent P0 arrives and must evict
        // one of them rather than being refused.
        let outcome = queue.enqueue(ItemId::from("urgent"), Priority::P0, 1, 100).await;
        assert!(outcome.success);
        assert!(queue.has(&ItemId::from("urgent")));

        let dlq = queue.get_dead_letter_queue();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].priority, Priority::P1);
        assert_eq!(dlq[0].reason, DeadLetterReason::LowerPriorityThanQueue);
    }

    #[tokio::test]
    async fn drop_lowest_priority_refuses_an_equally_or_less_urgent_incomer() {
        let mut cfg = config();
        cfg.rejection_policy = RejectionPolicy::DropLowestPriority;
        let queue = BoundedWorkQueue::new(cfg, plane());
        for i in 0..4 {
            queue
                .enqueue(ItemId::from(format!("p0-{i}")), Priority::P0, 1, i as i64)
                .await;
        }

        // Nothing in the queue is less urgent than the incoming P3; it must
        // be refused and the queue left untouched.
        let outcome = queue.enqueue(ItemId::from("low"), Priority::P3, 1, 100).await;
        assert!(!outcome.success);
        assert!(!queue.has(&ItemId::from("low")));
        assert!(queue.get_dead_letter_queue().is_empty());
        for i in 0..4 {
            assert!(queue.has(&ItemId::from(format!("p0-{i}"))));
        }
    }

    #[tokio::test]
    async fn duplicate_item_id_is_rejected() {
        let queue = BoundedWorkQueue::new(config(), plane());
        queue.enqueue(ItemId::from("dup"), Priority::P1, 1, 1).await;
        let outcome = queue.enqueue(ItemId::from("dup"), Priority::P1, 1, 2).await;
        assert!(!outcome.success);
    }
}
