//! TTL cache for subscription rows.
//!
//! Admission and dispatch both resolve subscriptions on every task, so a
//! short-lived cache keeps the hot path off the store. Writes from the
//! admin surface go through `insert`/`invalidate`, which keeps entries
//! no staler than the TTL.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::types::{Subscription, SubscriptionId};

pub struct SubscriptionCache {
    ttl: Duration,
    entries: RwLock<HashMap<SubscriptionId, CachedEntry>>,
}

struct CachedEntry {
    subscription: Subscription,
    expires_at: Instant,
}

impl SubscriptionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns a live cached row; expired entries are dropped on read.
    pub async fn get(&self, id: SubscriptionId) -> Option<Subscription> {
        {
            let entries = self.entries.read().await;
            match entries.get(&id) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Some(entry.subscription.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(&id) {
            if entry.expires_at <= Instant::now() {
                entries.remove(&id);
            }
        }
        None
    }

    pub async fn insert(&self, subscription: Subscription) {
        let mut entries = self.entries.write().await;
        entries.insert(
            subscription.id,
            CachedEntry {
                subscription,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub async fn invalidate(&self, id: SubscriptionId) {
        let mut entries = self.entries.write().await;
        entries.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn subscription() -> Subscription {
        Subscription::new("https://example.test/hook", Utc::now())
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = SubscriptionCache::new(Duration::from_secs(300));
        let sub = subscription();
        cache.insert(sub.clone()).await;

        assert!(cache.get(sub.id).await.is_some());

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert!(cache.get(sub.id).await.is_none());
    }

    #[tokio::test]
    async fn invalidate_removes_entries() {
        let cache = SubscriptionCache::new(Duration::from_secs(300));
        let sub = subscription();
        cache.insert(sub.clone()).await;
        cache.invalidate(sub.id).await;
        assert!(cache.get(sub.id).await.is_none());
    }

    #[tokio::test]
    async fn misses_return_none() {
        let cache = SubscriptionCache::new(Duration::from_secs(300));
        assert!(cache.get(SubscriptionId::new()).await.is_none());
    }
}
