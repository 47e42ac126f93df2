//! Persistence contract plus the in-memory reference backend.
//!
//! The store is the authoritative shared state of the pipeline. Workers
//! claim deliveries through `mark_processing`, an atomic compare-and-swap
//! that keeps concurrent consumers of a redelivered task from producing
//! a double attempt.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::types::{
    DeliveryAttempt, DeliveryId, DeliveryStatus, Subscription, SubscriptionId, WebhookDelivery,
};

/// Durable persistence for subscriptions, deliveries and attempts.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_subscription(&self, subscription: &Subscription) -> Result<(), StoreError>;
    async fn get_subscription(&self, id: SubscriptionId) -> Result<Subscription, StoreError>;
    async fn update_subscription(&self, subscription: &Subscription) -> Result<(), StoreError>;
    async fn delete_subscription(&self, id: SubscriptionId) -> Result<(), StoreError>;
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StoreError>;

    /// Inserts a new delivery; fails on a duplicate id.
    async fn create_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError>;
    async fn get_delivery(&self, id: DeliveryId) -> Result<WebhookDelivery, StoreError>;

    /// Persists `status`, `next_retry_at`, `retry_count` and the touch
    /// time of a delivery.
    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError>;

    /// Atomically claims a `Pending` delivery for processing.
    ///
    /// Returns `false` when the row is no longer `Pending`, which means
    /// another worker owns it or it already reached a terminal state.
    async fn mark_processing(
        &self,
        id: DeliveryId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Inserts exactly one attempt row.
    async fn append_attempt(&self, attempt: &DeliveryAttempt) -> Result<(), StoreError>;

    /// Attempts for a delivery, ordered by attempt number ascending.
    async fn list_attempts(
        &self,
        delivery_id: DeliveryId,
    ) -> Result<Vec<DeliveryAttempt>, StoreError>;

    /// Most recent deliveries for a subscription, newest first.
    async fn recent_deliveries(
        &self,
        subscription_id: SubscriptionId,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>, StoreError>;

    /// `Pending` deliveries whose retry time has passed (or was never
    /// set), oldest first. Feeds the recovery scan.
    async fn due_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>, StoreError>;

    /// `Processing` deliveries untouched since `cutoff`, i.e. claims
    /// orphaned by a crashed worker.
    async fn stale_processing(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>, StoreError>;

    /// Bulk-deletes attempt rows older than `cutoff`; returns the count.
    async fn delete_attempts_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// In-memory store for tests and single-process deployments.
///
/// A single mutex serializes every operation, which is what makes
/// `mark_processing` a genuine compare-and-swap here.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    subscriptions: HashMap<SubscriptionId, Subscription>,
    deliveries: HashMap<DeliveryId, WebhookDelivery>,
    attempts: Vec<DeliveryAttempt>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_subscription(&self, subscription: &Subscription) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.subscriptions.contains_key(&subscription.id) {
            return Err(StoreError::DuplicateSubscription(subscription.id));
        }
        inner
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn get_subscription(&self, id: SubscriptionId) -> Result<Subscription, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .subscriptions
            .get(&id)
            .cloned()
            .ok_or(StoreError::SubscriptionNotFound(id))
    }

    async fn update_subscription(&self, subscription: &Subscription) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.subscriptions.contains_key(&subscription.id) {
            return Err(StoreError::SubscriptionNotFound(subscription.id));
        }
        inner
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn delete_subscription(&self, id: SubscriptionId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .subscriptions
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::SubscriptionNotFound(id))
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        let inner = self.inner.lock().await;
        let mut subscriptions: Vec<Subscription> =
            inner.subscriptions.values().cloned().collect();
        subscriptions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(subscriptions)
    }

    async fn create_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.deliveries.contains_key(&delivery.id) {
            return Err(StoreError::DuplicateDelivery(delivery.id));
        }
        inner.deliveries.insert(delivery.id, delivery.clone());
        Ok(())
    }

    async fn get_delivery(&self, id: DeliveryId) -> Result<WebhookDelivery, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .deliveries
            .get(&id)
            .cloned()
            .ok_or(StoreError::DeliveryNotFound(id))
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .deliveries
            .get_mut(&delivery.id)
            .ok_or(StoreError::DeliveryNotFound(delivery.id))?;
        row.status = delivery.status;
        row.next_retry_at = delivery.next_retry_at;
        row.retry_count = delivery.retry_count;
        row.updated_at = delivery.updated_at;
        Ok(())
    }

    async fn mark_processing(
        &self,
        id: DeliveryId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .deliveries
            .get_mut(&id)
            .ok_or(StoreError::DeliveryNotFound(id))?;
        if row.status != DeliveryStatus::Pending {
            return Ok(false);
        }
        row.status = DeliveryStatus::Processing;
        row.updated_at = now;
        Ok(true)
    }

    async fn append_attempt(&self, attempt: &DeliveryAttempt) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.attempts.push(attempt.clone());
        Ok(())
    }

    async fn list_attempts(
        &self,
        delivery_id: DeliveryId,
    ) -> Result<Vec<DeliveryAttempt>, StoreError> {
        let inner = self.inner.lock().await;
        let mut attempts: Vec<DeliveryAttempt> = inner
            .attempts
            .iter()
            .filter(|a| a.delivery_id == delivery_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.attempt_number);
        Ok(attempts)
    }

    async fn recent_deliveries(
        &self,
        subscription_id: SubscriptionId,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>, StoreError> {
        let inner = self.inner.lock().await;
        let mut deliveries: Vec<WebhookDelivery> = inner
            .deliveries
            .values()
            .filter(|d| d.subscription_id == subscription_id)
            .cloned()
            .collect();
        deliveries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        deliveries.truncate(limit);
        Ok(deliveries)
    }

    async fn due_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>, StoreError> {
        let inner = self.inner.lock().await;
        let mut due: Vec<WebhookDelivery> = inner
            .deliveries
            .values()
            .filter(|d| {
                d.status == DeliveryStatus::Pending
                    && d.next_retry_at.map_or(true, |at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn stale_processing(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>, StoreError> {
        let inner = self.inner.lock().await;
        let mut stale: Vec<WebhookDelivery> = inner
            .deliveries
            .values()
            .filter(|d| d.status == DeliveryStatus::Processing && d.updated_at <= cutoff)
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        stale.truncate(limit);
        Ok(stale)
    }

    async fn delete_attempts_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.attempts.len();
        inner.attempts.retain(|a| a.created_at >= cutoff);
        Ok((before - inner.attempts.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery(subscription_id: SubscriptionId, now: DateTime<Utc>) -> WebhookDelivery {
        WebhookDelivery::new(subscription_id, b"{}".to_vec(), None, 5, now)
    }

    #[tokio::test]
    async fn subscription_crud_round_trip() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut subscription = Subscription::new("https://example.test/a", now);

        store.create_subscription(&subscription).await.unwrap();
        assert_eq!(
            store.create_subscription(&subscription).await,
            Err(StoreError::DuplicateSubscription(subscription.id))
        );

        subscription.target_url = "https://example.test/b".to_string();
        store.update_subscription(&subscription).await.unwrap();
        let loaded = store.get_subscription(subscription.id).await.unwrap();
        assert_eq!(loaded.target_url, "https://example.test/b");

        store.delete_subscription(subscription.id).await.unwrap();
        assert_eq!(
            store.get_subscription(subscription.id).await,
            Err(StoreError::SubscriptionNotFound(subscription.id))
        );
    }

    #[tokio::test]
    async fn duplicate_delivery_ids_are_rejected() {
        let store = InMemoryStore::new();
        let d = delivery(SubscriptionId::new(), Utc::now());
        store.create_delivery(&d).await.unwrap();
        assert_eq!(
            store.create_delivery(&d).await,
            Err(StoreError::DuplicateDelivery(d.id))
        );
    }

    #[tokio::test]
    async fn mark_processing_claims_only_pending_rows() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let d = delivery(SubscriptionId::new(), now);
        store.create_delivery(&d).await.unwrap();

        assert!(store.mark_processing(d.id, now).await.unwrap());
        // Second claim loses: the row is already Processing.
        assert!(!store.mark_processing(d.id, now).await.unwrap());

        let loaded = store.get_delivery(d.id).await.unwrap();
        assert_eq!(loaded.status, DeliveryStatus::Processing);
    }

    #[tokio::test]
    async fn attempts_are_listed_in_attempt_order() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let d = delivery(SubscriptionId::new(), now);
        store.create_delivery(&d).await.unwrap();

        for n in [2u32, 1, 3] {
            let attempt =
                DeliveryAttempt::failed(d.id, n, Some(500), format!("HTTP 500: {n}"), now);
            store.append_attempt(&attempt).await.unwrap();
        }

        let attempts = store.list_attempts(d.id).await.unwrap();
        let numbers: Vec<u32> = attempts.iter().map(|a| a.attempt_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn recent_deliveries_are_newest_first_and_limited() {
        let store = InMemoryStore::new();
        let subscription_id = SubscriptionId::new();
        let base = Utc::now();

        for offset in 0..5 {
            let d = delivery(subscription_id, base + chrono::Duration::seconds(offset));
            store.create_delivery(&d).await.unwrap();
        }

        let recent = store.recent_deliveries(subscription_id, 3).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert!(recent.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    }

    #[tokio::test]
    async fn due_deliveries_respects_status_and_retry_time() {
        let store = InMemoryStore::new();
        let subscription_id = SubscriptionId::new();
        let now = Utc::now();

        let fresh = delivery(subscription_id, now);
        store.create_delivery(&fresh).await.unwrap();

        let mut scheduled = delivery(subscription_id, now);
        scheduled.next_retry_at = Some(now + chrono::Duration::minutes(5));
        store.create_delivery(&scheduled).await.unwrap();

        let mut done = delivery(subscription_id, now);
        done.status = DeliveryStatus::Delivered;
        store.create_delivery(&done).await.unwrap();

        let due = store.due_deliveries(now, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, fresh.id);

        let later = now + chrono::Duration::minutes(6);
        let due = store.due_deliveries(later, 10).await.unwrap();
        assert_eq!(due.len(), 2);
    }

    #[tokio::test]
    async fn stale_processing_finds_abandoned_claims() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let d = delivery(SubscriptionId::new(), now);
        store.create_delivery(&d).await.unwrap();
        store.mark_processing(d.id, now).await.unwrap();

        let stale = store
            .stale_processing(now - chrono::Duration::seconds(20), 10)
            .await
            .unwrap();
        assert!(stale.is_empty());

        let stale = store
            .stale_processing(now + chrono::Duration::seconds(20), 10)
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, d.id);
    }

    #[tokio::test]
    async fn retention_deletes_only_aged_attempts() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let d = delivery(SubscriptionId::new(), now);
        store.create_delivery(&d).await.unwrap();

        let old = DeliveryAttempt::failed(
            d.id,
            1,
            Some(500),
            "HTTP 500: ".to_string(),
            now - chrono::Duration::hours(80),
        );
        let recent = DeliveryAttempt::succeeded(d.id, 2, 200, now);
        store.append_attempt(&old).await.unwrap();
        store.append_attempt(&recent).await.unwrap();

        let cutoff = now - chrono::Duration::hours(72);
        assert_eq!(store.delete_attempts_older_than(cutoff).await.unwrap(), 1);

        let remaining = store.list_attempts(d.id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].attempt_number, 2);
    }
}
