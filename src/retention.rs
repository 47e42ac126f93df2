//! Scheduled deletion of aged attempt rows.
//!
//! Deliveries are never touched; only their audit trail ages out, so
//! the record for an old delivery becomes coarse rather than absent.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::CourierConfig;
use crate::error::StoreError;
use crate::metrics::metric_count;
use crate::store::Store;

pub struct RetentionSweeper {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    retention: Duration,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: &CourierConfig) -> Self {
        Self {
            store,
            clock,
            interval: config.retention_sweep_interval,
            retention: config.log_retention,
        }
    }

    /// One sweep; returns the number of attempt rows deleted.
    pub async fn run_once(&self) -> Result<u64, StoreError> {
        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = self.clock.now() - retention;

        let deleted = self.store.delete_attempts_older_than(cutoff).await?;
        if deleted > 0 {
            metric_count("courier.retention.attempts_deleted", deleted);
            info!(deleted, "swept aged delivery attempts");
        }
        Ok(deleted)
    }

    /// Sweeps on the configured interval until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.clock.sleep(self.interval) => {}
            }
            if let Err(error) = self.run_once().await {
                warn!(%error, "retention sweep failed");
            }
        }
    }
}
