//! Admission pipeline and the operations the admin surface calls.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache::SubscriptionCache;
use crate::clock::{Clock, SystemClock};
use crate::config::CourierConfig;
use crate::error::CourierError;
use crate::metrics::metric_inc;
use crate::queue::TaskQueue;
use crate::signing;
use crate::store::Store;
use crate::types::{
    validate_target_url, DeliveryAttempt, DeliveryId, Subscription, SubscriptionId,
    WebhookDelivery,
};

/// Result of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A delivery row exists and a task is queued.
    Accepted { delivery_id: DeliveryId },

    /// The event type is not subscribed; nothing was created. Reported
    /// as success upstream.
    Skipped,
}

/// Front half of the service: subscription management, event admission
/// and the read queries behind the status endpoints.
///
/// The background half (workers, reconciler, sweeper) lives in
/// [`crate::worker::Pipeline`]; both halves share the store, the queue
/// and the subscription cache.
pub struct Courier {
    store: Arc<dyn Store>,
    queue: Arc<dyn TaskQueue>,
    cache: Arc<SubscriptionCache>,
    clock: Arc<dyn Clock>,
    config: CourierConfig,
}

impl Courier {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn TaskQueue>,
        cache: Arc<SubscriptionCache>,
        config: CourierConfig,
    ) -> Self {
        Self::with_clock(store, queue, cache, Arc::new(SystemClock), config)
    }

    pub fn with_clock(
        store: Arc<dyn Store>,
        queue: Arc<dyn TaskQueue>,
        cache: Arc<SubscriptionCache>,
        clock: Arc<dyn Clock>,
        config: CourierConfig,
    ) -> Self {
        Self {
            store,
            queue,
            cache,
            clock,
            config,
        }
    }

    /// Registers a destination.
    pub async fn create_subscription(
        &self,
        target_url: String,
        secret_key: Option<String>,
        event_types: Vec<String>,
    ) -> Result<Subscription, CourierError> {
        if !validate_target_url(&target_url) {
            return Err(CourierError::InvalidTargetUrl(target_url));
        }

        let now = self.clock.now();
        let mut subscription = Subscription::new(target_url, now);
        subscription.secret_key = secret_key;
        subscription.event_types = event_types;

        self.store.create_subscription(&subscription).await?;
        self.cache.insert(subscription.clone()).await;
        info!(subscription_id = %subscription.id, "subscription created");
        Ok(subscription)
    }

    pub async fn get_subscription(
        &self,
        id: SubscriptionId,
    ) -> Result<Subscription, CourierError> {
        self.subscription_for(id).await
    }

    /// Replaces the mutable fields of a subscription. The id is
    /// immutable; the new target URL must still be deliverable.
    pub async fn update_subscription(
        &self,
        id: SubscriptionId,
        target_url: String,
        secret_key: Option<String>,
        event_types: Vec<String>,
    ) -> Result<Subscription, CourierError> {
        if !validate_target_url(&target_url) {
            return Err(CourierError::InvalidTargetUrl(target_url));
        }

        let mut subscription = self.store.get_subscription(id).await?;
        subscription.target_url = target_url;
        subscription.secret_key = secret_key;
        subscription.event_types = event_types;
        subscription.updated_at = self.clock.now();

        self.store.update_subscription(&subscription).await?;
        self.cache.insert(subscription.clone()).await;
        Ok(subscription)
    }

    pub async fn delete_subscription(&self, id: SubscriptionId) -> Result<(), CourierError> {
        self.store.delete_subscription(id).await?;
        self.cache.invalidate(id).await;
        info!(subscription_id = %id, "subscription deleted");
        Ok(())
    }

    pub async fn list_subscriptions(&self) -> Result<Vec<Subscription>, CourierError> {
        Ok(self.store.list_subscriptions().await?)
    }

    /// Admission pipeline for an incoming event.
    ///
    /// Resolves the subscription, applies the event-type filter,
    /// verifies the signature when one is present, then durably creates
    /// the delivery and queues its first attempt. Failures after the
    /// row exists leave it in `Pending` for the reconciler to pick up.
    pub async fn ingest(
        &self,
        subscription_id: SubscriptionId,
        event_type: Option<&str>,
        payload: Vec<u8>,
        signature: Option<&str>,
    ) -> Result<IngestOutcome, CourierError> {
        let subscription = self.subscription_for(subscription_id).await?;

        let event_type = event_type.filter(|t| !t.is_empty());
        if !subscription.accepts_event(event_type) {
            debug!(
                subscription_id = %subscription_id,
                event_type = event_type.unwrap_or_default(),
                "event type not subscribed, skipping"
            );
            metric_inc("courier.ingest.skipped");
            return Ok(IngestOutcome::Skipped);
        }

        if let Some(secret) = subscription.signing_secret() {
            match signature.filter(|s| !s.is_empty()) {
                Some(signature) => {
                    if !signing::verify(&payload, signature, secret) {
                        warn!(subscription_id = %subscription_id, "invalid webhook signature");
                        metric_inc("courier.ingest.rejected");
                        return Err(CourierError::InvalidSignature);
                    }
                }
                // Unsigned requests against a secret-bearing subscription
                // pass unless the deployment opts into strictness.
                None if self.config.require_signature_when_secret => {
                    warn!(subscription_id = %subscription_id, "missing webhook signature");
                    metric_inc("courier.ingest.rejected");
                    return Err(CourierError::MissingSignature);
                }
                None => {}
            }
        }

        let delivery = WebhookDelivery::new(
            subscription_id,
            payload,
            event_type.map(str::to_string),
            self.config.retry_limit,
            self.clock.now(),
        );

        self.store.create_delivery(&delivery).await?;
        self.queue.enqueue(delivery.id, Duration::ZERO).await?;
        metric_inc("courier.ingest.accepted");
        info!(
            delivery_id = %delivery.id,
            subscription_id = %subscription_id,
            "webhook queued for delivery"
        );

        Ok(IngestOutcome::Accepted {
            delivery_id: delivery.id,
        })
    }

    /// Delivery plus its full attempt audit, for the status endpoint.
    pub async fn delivery_status(
        &self,
        id: DeliveryId,
    ) -> Result<(WebhookDelivery, Vec<DeliveryAttempt>), CourierError> {
        let delivery = self.store.get_delivery(id).await?;
        let attempts = self.store.list_attempts(id).await?;
        Ok((delivery, attempts))
    }

    /// Recent deliveries for a subscription, newest first. A zero limit
    /// falls back to the default page size.
    pub async fn recent_deliveries(
        &self,
        subscription_id: SubscriptionId,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>, CourierError> {
        let limit = if limit == 0 { 20 } else { limit };
        Ok(self.store.recent_deliveries(subscription_id, limit).await?)
    }

    /// Cache-first subscription lookup.
    async fn subscription_for(
        &self,
        id: SubscriptionId,
    ) -> Result<Subscription, CourierError> {
        if let Some(subscription) = self.cache.get(id).await {
            return Ok(subscription);
        }
        let subscription = self.store.get_subscription(id).await?;
        self.cache.insert(subscription.clone()).await;
        Ok(subscription)
    }
}
