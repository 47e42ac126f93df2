//! Worker pool that drains the task queue and drives the per-delivery
//! state machine.
//!
//! Each worker runs one task at a time: load the delivery, claim it with
//! a compare-and-swap into `Processing`, dispatch, append the attempt
//! row, then either mark it `Delivered` or consult the retry policy.
//! The queue ack always comes last, so a crash anywhere in the middle
//! redelivers the task and the claim guard keeps the rerun from
//! double-attempting.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::SubscriptionCache;
use crate::clock::Clock;
use crate::config::CourierConfig;
use crate::dispatch::Dispatch;
use crate::error::{DispatchOutcome, QueueError, StoreError};
use crate::metrics::metric_inc;
use crate::queue::{LeasedTask, TaskQueue};
use crate::reconcile::Reconciler;
use crate::retention::RetentionSweeper;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::Store;
use crate::types::{DeliveryAttempt, DeliveryStatus, Subscription, SubscriptionId};

/// Shared dependencies for all workers.
pub struct WorkerContext {
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn TaskQueue>,
    pub dispatcher: Arc<dyn Dispatch>,
    pub cache: Arc<SubscriptionCache>,
    pub clock: Arc<dyn Clock>,
    pub policy: RetryPolicy,
}

/// Infrastructure failure that aborts a task without acking it, leaving
/// redelivery to the visibility timeout.
#[derive(Debug)]
enum TaskAbort {
    Store(StoreError),
    Queue(QueueError),
}

impl fmt::Display for TaskAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskAbort::Store(err) => err.fmt(f),
            TaskAbort::Queue(err) => err.fmt(f),
        }
    }
}

impl From<StoreError> for TaskAbort {
    fn from(err: StoreError) -> Self {
        TaskAbort::Store(err)
    }
}

impl From<QueueError> for TaskAbort {
    fn from(err: QueueError) -> Self {
        TaskAbort::Queue(err)
    }
}

/// Fixed pool of queue consumers.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    queue: Arc<dyn TaskQueue>,
    shutdown_grace: Duration,
}

impl WorkerPool {
    /// Spawns `worker_concurrency` consumers against the shared context.
    pub fn start(ctx: Arc<WorkerContext>, config: &CourierConfig) -> Self {
        let mut handles = Vec::with_capacity(config.worker_concurrency);
        for worker_id in 0..config.worker_concurrency {
            handles.push(tokio::spawn(worker_loop(worker_id, ctx.clone())));
        }
        Self {
            handles,
            queue: ctx.queue.clone(),
            shutdown_grace: config.shutdown_grace,
        }
    }

    /// Closes the queue, then waits for in-flight attempts to finish,
    /// bounded by the shutdown grace period.
    pub async fn shutdown(mut self) {
        self.queue.close();

        let handles = std::mem::take(&mut self.handles);
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(self.shutdown_grace, drain).await.is_err() {
            warn!("shutdown grace elapsed with workers still in flight");
        }
    }
}

async fn worker_loop(worker_id: usize, ctx: Arc<WorkerContext>) {
    debug!(worker_id, "delivery worker starting");

    while let Some(task) = ctx.queue.dequeue().await {
        match process_task(&ctx, &task).await {
            Ok(()) => {
                if let Err(error) = ctx.queue.ack(&task).await {
                    warn!(
                        worker_id,
                        delivery_id = %task.delivery_id,
                        %error,
                        "task ack failed"
                    );
                }
            }
            Err(error) => {
                // No ack: the visibility timeout will redeliver, and the
                // claim guard makes the rerun safe.
                warn!(
                    worker_id,
                    delivery_id = %task.delivery_id,
                    %error,
                    "task aborted, leaving it for redelivery"
                );
            }
        }
    }

    debug!(worker_id, "delivery worker stopped");
}

/// Runs one leased task through the delivery state machine.
///
/// `Ok(())` means the task is finished from the queue's point of view
/// and must be acked, including the drop cases (row gone, terminal,
/// claim lost). `Err` means infrastructure failed mid-flight and the
/// task should stay leased.
async fn process_task(ctx: &WorkerContext, task: &LeasedTask) -> Result<(), TaskAbort> {
    let mut delivery = match ctx.store.get_delivery(task.delivery_id).await {
        Ok(delivery) => delivery,
        Err(StoreError::DeliveryNotFound(_)) => {
            debug!(delivery_id = %task.delivery_id, "delivery row gone, dropping task");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    // Idempotency guard: terminal states absorb redelivered tasks.
    if delivery.status.is_terminal() {
        debug!(
            delivery_id = %delivery.id,
            status = %delivery.status,
            "delivery already terminal, dropping task"
        );
        return Ok(());
    }

    let now = ctx.clock.now();

    // A task can surface before its delivery is due (queue clock skew,
    // reconciler requeue). Push it back for the residual wait.
    if delivery.status == DeliveryStatus::Pending {
        if let Some(next_retry_at) = delivery.next_retry_at {
            if next_retry_at > now {
                let residual = (next_retry_at - now).to_std().unwrap_or(Duration::ZERO);
                ctx.queue.enqueue(delivery.id, residual).await?;
                debug!(
                    delivery_id = %delivery.id,
                    residual_ms = residual.as_millis() as u64,
                    "task early, rescheduled for its retry time"
                );
                return Ok(());
            }
        }
    }

    if !ctx.store.mark_processing(delivery.id, now).await? {
        debug!(delivery_id = %delivery.id, "claim lost to another worker, dropping task");
        return Ok(());
    }
    delivery.status = DeliveryStatus::Processing;
    delivery.updated_at = now;

    // The subscription may be gone: admission raced a delete, or the
    // row was removed mid-retry. Treated as a transport failure so the
    // delivery still burns budget and terminates.
    let subscription = lookup_subscription(ctx, delivery.subscription_id).await?;
    let outcome = match &subscription {
        Some(subscription) => ctx.dispatcher.dispatch(&delivery, subscription).await,
        None => DispatchOutcome::TransportFailure {
            error: "subscription deleted".to_string(),
        },
    };

    let attempt_number = delivery.retry_count + 1;
    let completed_at = ctx.clock.now();
    let attempt = match &outcome {
        DispatchOutcome::Success { status_code } => {
            DeliveryAttempt::succeeded(delivery.id, attempt_number, *status_code, completed_at)
        }
        failure => DeliveryAttempt::failed(
            delivery.id,
            attempt_number,
            failure.status_code(),
            failure.error_details().unwrap_or_default(),
            completed_at,
        ),
    };
    ctx.store.append_attempt(&attempt).await?;

    delivery.updated_at = completed_at;
    match outcome {
        DispatchOutcome::Success { status_code } => {
            delivery.status = DeliveryStatus::Delivered;
            delivery.next_retry_at = None;
            ctx.store.update_delivery(&delivery).await?;
            metric_inc("courier.delivery.delivered");
            info!(
                delivery_id = %delivery.id,
                status_code,
                attempt = attempt_number,
                "webhook delivered"
            );
        }
        _ => {
            delivery.retry_count += 1;
            metric_inc("courier.attempt.failed");
            match ctx.policy.decide(delivery.retry_count) {
                RetryDecision::GiveUp => {
                    delivery.status = DeliveryStatus::Failed;
                    delivery.next_retry_at = None;
                    ctx.store.update_delivery(&delivery).await?;
                    metric_inc("courier.delivery.failed");
                    warn!(
                        delivery_id = %delivery.id,
                        retry_count = delivery.retry_count,
                        "retry budget spent, delivery terminally failed"
                    );
                }
                RetryDecision::Retry { delay } => {
                    delivery.status = DeliveryStatus::Pending;
                    delivery.next_retry_at = Some(
                        completed_at
                            + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::zero()),
                    );
                    ctx.store.update_delivery(&delivery).await?;
                    ctx.queue.enqueue(delivery.id, delay).await?;
                    metric_inc("courier.delivery.retry_scheduled");
                    info!(
                        delivery_id = %delivery.id,
                        retry_count = delivery.retry_count,
                        delay_secs = delay.as_secs(),
                        "retry scheduled"
                    );
                }
            }
        }
    }

    Ok(())
}

/// Cache-first subscription lookup. `Ok(None)` means the row is gone.
async fn lookup_subscription(
    ctx: &WorkerContext,
    id: SubscriptionId,
) -> Result<Option<Subscription>, StoreError> {
    if let Some(subscription) = ctx.cache.get(id).await {
        return Ok(Some(subscription));
    }
    match ctx.store.get_subscription(id).await {
        Ok(subscription) => {
            ctx.cache.insert(subscription.clone()).await;
            Ok(Some(subscription))
        }
        Err(StoreError::SubscriptionNotFound(_)) => Ok(None),
        Err(err) => Err(err),
    }
}

/// The background half of the service: worker pool, recovery scan and
/// retention sweep, wired from one config.
pub struct Pipeline {
    pool: WorkerPool,
    cancel: CancellationToken,
    maintenance: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Spawns workers, the reconciler and the retention sweeper.
    pub fn start(ctx: Arc<WorkerContext>, config: &CourierConfig) -> Self {
        let pool = WorkerPool::start(ctx.clone(), config);
        let cancel = CancellationToken::new();

        let reconciler = Reconciler::new(
            ctx.store.clone(),
            ctx.queue.clone(),
            ctx.clock.clone(),
            config,
        );
        let sweeper = RetentionSweeper::new(ctx.store.clone(), ctx.clock.clone(), config);

        let maintenance = vec![
            tokio::spawn({
                let cancel = cancel.clone();
                async move { reconciler.run(cancel).await }
            }),
            tokio::spawn({
                let cancel = cancel.clone();
                async move { sweeper.run(cancel).await }
            }),
        ];

        Self {
            pool,
            cancel,
            maintenance,
        }
    }

    /// Graceful shutdown: stop maintenance, then drain the workers.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.maintenance {
            let _ = handle.await;
        }
        self.pool.shutdown().await;
    }
}
