//! Durable task queue contract with deferred visibility, plus the
//! in-process implementation.
//!
//! The queue carries only delivery ids. Consumption is at-least-once: a
//! dequeued task is leased to exactly one worker, and an unacked lease
//! is redelivered once its visibility timeout lapses. Workers re-check
//! delivery state from the store before dispatching, so redelivery is
//! safe.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep_until, Instant};

use crate::error::QueueError;
use crate::types::DeliveryId;

/// Opaque lease handle for one dequeued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(pub u64);

/// A task leased to one worker until acked or the visibility timeout
/// lapses.
#[derive(Debug, Clone)]
pub struct LeasedTask {
    pub delivery_id: DeliveryId,
    pub lease: LeaseId,
}

/// Task queue keyed by delivery id with deferred visibility.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Schedules a task that becomes visible to workers after `delay`.
    async fn enqueue(&self, delivery_id: DeliveryId, delay: Duration) -> Result<(), QueueError>;

    /// Waits for the next visible task. Returns `None` once the queue
    /// has been closed.
    async fn dequeue(&self) -> Option<LeasedTask>;

    /// Acknowledges a completed task. Must follow all persistence for
    /// the task; a late ack of an already-redelivered lease is a no-op.
    async fn ack(&self, task: &LeasedTask) -> Result<(), QueueError>;

    /// Stops handing out tasks. Pending enqueues fail with `Shutdown`.
    fn close(&self);
}

/// In-process queue for tests and single-node deployments.
///
/// Delayed tasks sit in a min-heap ordered by their visibility deadline;
/// leased tasks carry a redelivery deadline. Consumers park on a
/// `Notify` until the earliest deadline or a new enqueue wakes them.
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    closed: AtomicBool,
    next_lease: AtomicU64,
    visibility_timeout: Duration,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<DeliveryId>,
    delayed: BinaryHeap<TimedTask>,
    in_flight: HashMap<LeaseId, InFlight>,
}

struct InFlight {
    delivery_id: DeliveryId,
    redeliver_at: Instant,
}

/// Heap entry for a deferred task, keyed earliest-deadline-first.
///
/// `BinaryHeap` is a max-heap, so the deadline is wrapped in `Reverse`
/// and the derived lexicographic order does the rest; the id only
/// breaks ties.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct TimedTask {
    ready_at: Reverse<Instant>,
    delivery_id: DeliveryId,
}

impl InMemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            next_lease: AtomicU64::new(0),
            visibility_timeout,
        }
    }

    /// Moves due delayed tasks and expired leases into the ready queue.
    /// Returns the earliest deadline still outstanding, if any.
    fn promote_due(state: &mut QueueState, now: Instant) -> Option<Instant> {
        while let Some(task) = state.delayed.peek() {
            let Reverse(ready_at) = task.ready_at;
            if ready_at > now {
                break;
            }
            let task = state.delayed.pop().expect("peeked entry");
            state.ready.push_back(task.delivery_id);
        }

        let expired: Vec<LeaseId> = state
            .in_flight
            .iter()
            .filter(|(_, t)| t.redeliver_at <= now)
            .map(|(lease, _)| *lease)
            .collect();
        for lease in expired {
            if let Some(task) = state.in_flight.remove(&lease) {
                state.ready.push_back(task.delivery_id);
            }
        }

        let next_delayed = state.delayed.peek().map(|t| t.ready_at.0);
        let next_redelivery = state.in_flight.values().map(|t| t.redeliver_at).min();
        match (next_delayed, next_redelivery) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (deadline, None) | (None, deadline) => deadline,
        }
    }
}

#[async_trait]
impl TaskQueue for InMemoryQueue {
    async fn enqueue(&self, delivery_id: DeliveryId, delay: Duration) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Shutdown);
        }

        let mut state = self.state.lock().await;
        if delay.is_zero() {
            state.ready.push_back(delivery_id);
        } else {
            state.delayed.push(TimedTask {
                ready_at: Reverse(Instant::now() + delay),
                delivery_id,
            });
        }
        drop(state);

        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self) -> Option<LeasedTask> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }

            let deadline = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let deadline = Self::promote_due(&mut state, now);

                if let Some(delivery_id) = state.ready.pop_front() {
                    let lease = LeaseId(self.next_lease.fetch_add(1, Ordering::Relaxed));
                    state.in_flight.insert(
                        lease,
                        InFlight {
                            delivery_id,
                            redeliver_at: now + self.visibility_timeout,
                        },
                    );
                    return Some(LeasedTask { delivery_id, lease });
                }
                deadline
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = sleep_until(deadline) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    async fn ack(&self, task: &LeasedTask) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.in_flight.remove(&task.lease);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> InMemoryQueue {
        InMemoryQueue::new(Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_tasks_are_visible_at_once() {
        let q = queue();
        let id = DeliveryId::new();
        q.enqueue(id, Duration::ZERO).await.unwrap();

        let task = q.dequeue().await.unwrap();
        assert_eq!(task.delivery_id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_tasks_stay_invisible_until_due() {
        let q = queue();
        let id = DeliveryId::new();
        q.enqueue(id, Duration::from_secs(10)).await.unwrap();

        let early = tokio::time::timeout(Duration::from_secs(9), q.dequeue()).await;
        assert!(early.is_err(), "task visible before its delay elapsed");

        let task = tokio::time::timeout(Duration::from_secs(2), q.dequeue())
            .await
            .expect("task due")
            .unwrap();
        assert_eq!(task.delivery_id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_tasks_are_redelivered() {
        let q = queue();
        let id = DeliveryId::new();
        q.enqueue(id, Duration::ZERO).await.unwrap();

        let first = q.dequeue().await.unwrap();
        assert_eq!(first.delivery_id, id);

        // Never acked: the lease lapses and the task comes back.
        let second = tokio::time::timeout(Duration::from_secs(31), q.dequeue())
            .await
            .expect("redelivery due")
            .unwrap();
        assert_eq!(second.delivery_id, id);
        assert_ne!(second.lease, first.lease);
    }

    #[tokio::test(start_paused = true)]
    async fn acked_tasks_are_not_redelivered() {
        let q = queue();
        q.enqueue(DeliveryId::new(), Duration::ZERO).await.unwrap();

        let task = q.dequeue().await.unwrap();
        q.ack(&task).await.unwrap();

        let again = tokio::time::timeout(Duration::from_secs(120), q.dequeue()).await;
        assert!(again.is_err(), "acked task was redelivered");
    }

    #[tokio::test(start_paused = true)]
    async fn close_wakes_consumers_and_rejects_enqueues() {
        let q = std::sync::Arc::new(queue());
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.dequeue().await })
        };

        tokio::task::yield_now().await;
        q.close();

        assert!(consumer.await.unwrap().is_none());
        assert_eq!(
            q.enqueue(DeliveryId::new(), Duration::ZERO).await,
            Err(QueueError::Shutdown)
        );
    }
}
