//! Time source for the pipeline.
//!
//! Retry arithmetic compares wall-clock timestamps against tokio timers,
//! so both must advance together for tests that run under paused time.
//! Workers, the reconciler and the sweeper only see time through this
//! trait.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Sleeps on the runtime's timer.
    async fn sleep(&self, duration: Duration);
}

/// Production clock: real wall time, real timers.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Clock derived from the tokio timer, for tests running with
/// `start_paused`.
///
/// `now()` is the fixed base plus the runtime's (possibly virtual)
/// elapsed time, so timestamps written by workers line up exactly with
/// queue visibility deadlines.
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    base: DateTime<Utc>,
    started: Instant,
}

impl SimulatedClock {
    pub fn new(base: DateTime<Utc>) -> Self {
        Self {
            base,
            started: Instant::now(),
        }
    }
}

#[async_trait]
impl Clock for SimulatedClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.started.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.base + elapsed
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn simulated_clock_tracks_virtual_time() {
        let base = Utc::now();
        let clock = SimulatedClock::new(base);
        assert_eq!(clock.now(), base);

        clock.sleep(Duration::from_secs(90)).await;
        assert_eq!(clock.now() - base, chrono::Duration::seconds(90));
    }
}
