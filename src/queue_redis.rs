#[cfg(feature = "redis")]
use std::str::FromStr;
#[cfg(feature = "redis")]
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
#[cfg(feature = "redis")]
use std::time::Duration;

#[cfg(feature = "redis")]
use async_trait::async_trait;
#[cfg(feature = "redis")]
use chrono::Utc;
#[cfg(feature = "redis")]
use redis::AsyncCommands;
#[cfg(feature = "redis")]
use tracing::warn;
#[cfg(feature = "redis")]
use uuid::Uuid;

#[cfg(feature = "redis")]
use crate::error::QueueError;
#[cfg(feature = "redis")]
use crate::queue::{LeaseId, LeasedTask, TaskQueue};
#[cfg(feature = "redis")]
use crate::types::DeliveryId;

/// Redis-backed queue using two sorted sets.
///
/// `{prefix}:ready` holds delivery ids scored by their visibility time;
/// `{prefix}:leased` holds dequeued ids scored by their redelivery
/// deadline. A member is moved between the sets with a remove-then-add
/// pair, and the remove count arbitrates racing consumers. Re-enqueueing
/// a delivery that is already queued collapses onto the same member,
/// which is harmless: one task per delivery is all the workers need.
#[cfg(feature = "redis")]
pub struct RedisQueue {
    client: redis::Client,
    prefix: String,
    visibility_timeout: Duration,
    poll_interval: Duration,
    closed: AtomicBool,
    next_lease: AtomicU64,
}

#[cfg(feature = "redis")]
impl RedisQueue {
    pub fn new(
        client: redis::Client,
        prefix: impl Into<String>,
        visibility_timeout: Duration,
    ) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            visibility_timeout,
            poll_interval: Duration::from_millis(500),
            closed: AtomicBool::new(false),
            next_lease: AtomicU64::new(0),
        }
    }

    fn ready_key(&self) -> String {
        format!("{}:ready", self.prefix)
    }

    fn leased_key(&self) -> String {
        format!("{}:leased", self.prefix)
    }

    /// Moves expired leases back into the ready set.
    async fn reclaim_expired(
        &self,
        conn: &mut redis::aio::Connection,
        now_ms: i64,
    ) -> redis::RedisResult<()> {
        let expired: Vec<String> = conn
            .zrangebyscore_limit(self.leased_key(), "-inf", now_ms, 0, 16)
            .await?;
        for member in expired {
            let removed: i64 = conn.zrem(self.leased_key(), &member).await?;
            if removed == 1 {
                let _: i64 = conn.zadd(self.ready_key(), &member, now_ms).await?;
            }
        }
        Ok(())
    }

    /// Pops one due member from the ready set, if any.
    async fn pop_due(
        &self,
        conn: &mut redis::aio::Connection,
        now_ms: i64,
    ) -> redis::RedisResult<Option<String>> {
        let due: Vec<String> = conn
            .zrangebyscore_limit(self.ready_key(), "-inf", now_ms, 0, 1)
            .await?;
        let Some(member) = due.into_iter().next() else {
            return Ok(None);
        };

        // The remove count decides which of the racing consumers won.
        let removed: i64 = conn.zrem(self.ready_key(), &member).await?;
        if removed != 1 {
            return Ok(None);
        }

        let redeliver_at = now_ms + self.visibility_timeout.as_millis() as i64;
        let _: i64 = conn.zadd(self.leased_key(), &member, redeliver_at).await?;
        Ok(Some(member))
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl TaskQueue for RedisQueue {
    async fn enqueue(&self, delivery_id: DeliveryId, delay: Duration) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Shutdown);
        }

        let mut conn = self
            .client
            .get_tokio_connection()
            .await
            .map_err(|err| QueueError::Backend(err.to_string()))?;

        let visible_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let _: i64 = conn
            .zadd(self.ready_key(), delivery_id.to_string(), visible_at)
            .await
            .map_err(|err| QueueError::Backend(err.to_string()))?;
        Ok(())
    }

    async fn dequeue(&self) -> Option<LeasedTask> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }

            let popped = match self.client.get_tokio_connection().await {
                Ok(mut conn) => {
                    let now_ms = Utc::now().timestamp_millis();
                    if let Err(error) = self.reclaim_expired(&mut conn, now_ms).await {
                        warn!(%error, "lease reclaim failed");
                    }
                    match self.pop_due(&mut conn, now_ms).await {
                        Ok(popped) => popped,
                        Err(error) => {
                            warn!(%error, "queue read failed");
                            None
                        }
                    }
                }
                Err(error) => {
                    warn!(%error, "queue connection failed");
                    None
                }
            };

            if let Some(member) = popped {
                match Uuid::from_str(&member) {
                    Ok(uuid) => {
                        let lease = LeaseId(self.next_lease.fetch_add(1, Ordering::Relaxed));
                        return Some(LeasedTask {
                            delivery_id: DeliveryId(uuid),
                            lease,
                        });
                    }
                    Err(_) => {
                        // Malformed member: drop it for good rather than
                        // redelivering garbage forever.
                        warn!(%member, "malformed task payload dropped");
                        if let Ok(mut conn) = self.client.get_tokio_connection().await {
                            let _: Result<i64, _> = conn.zrem(self.leased_key(), &member).await;
                        }
                        continue;
                    }
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn ack(&self, task: &LeasedTask) -> Result<(), QueueError> {
        let mut conn = self
            .client
            .get_tokio_connection()
            .await
            .map_err(|err| QueueError::Backend(err.to_string()))?;
        let _: i64 = conn
            .zrem(self.leased_key(), task.delivery_id.to_string())
            .await
            .map_err(|err| QueueError::Backend(err.to_string()))?;
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
