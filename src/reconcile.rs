//! Recovery scan for deliveries the queue lost track of.
//!
//! Two classes of orphan exist. A delivery created right before a crash
//! (or whose enqueue failed) sits in `Pending` with no queue task; and a
//! worker that died mid-attempt leaves its claim stuck in `Processing`.
//! The reconciler re-enqueues the former and flips the latter back to
//! `Pending` once the claim has clearly been abandoned.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::CourierConfig;
use crate::error::CourierError;
use crate::queue::TaskQueue;
use crate::store::Store;
use crate::types::DeliveryStatus;

/// Rows examined per pass and per class.
const SCAN_BATCH: usize = 100;

pub struct Reconciler {
    store: Arc<dyn Store>,
    queue: Arc<dyn TaskQueue>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    /// A `Processing` row untouched for this long is considered
    /// abandoned. Twice the dispatch deadline leaves a healthy worker
    /// ample room to finish and persist.
    stale_after: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn TaskQueue>,
        clock: Arc<dyn Clock>,
        config: &CourierConfig,
    ) -> Self {
        Self {
            store,
            queue,
            clock,
            interval: config.reconcile_interval,
            stale_after: config.dispatch_timeout * 2,
        }
    }

    /// One pass; returns how many deliveries were requeued.
    pub async fn run_once(&self) -> Result<usize, CourierError> {
        let now = self.clock.now();
        let mut recovered = 0;

        for delivery in self.store.due_deliveries(now, SCAN_BATCH).await? {
            self.queue.enqueue(delivery.id, Duration::ZERO).await?;
            recovered += 1;
        }

        let stale_after = chrono::Duration::from_std(self.stale_after)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = now - stale_after;
        for mut delivery in self.store.stale_processing(cutoff, SCAN_BATCH).await? {
            delivery.status = DeliveryStatus::Pending;
            delivery.next_retry_at = None;
            delivery.updated_at = now;
            self.store.update_delivery(&delivery).await?;
            self.queue.enqueue(delivery.id, Duration::ZERO).await?;
            recovered += 1;
        }

        if recovered > 0 {
            info!(recovered, "requeued deliveries during reconciliation");
        }
        Ok(recovered)
    }

    /// Scans immediately (startup recovery), then on the configured
    /// interval until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if let Err(error) = self.run_once().await {
                warn!(%error, "reconciliation pass failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.clock.sleep(self.interval) => {}
            }
        }
    }
}
