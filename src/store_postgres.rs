#[cfg(feature = "postgres")]
use async_trait::async_trait;
#[cfg(feature = "postgres")]
use chrono::{DateTime, Utc};
#[cfg(feature = "postgres")]
use tokio_postgres::error::SqlState;
#[cfg(feature = "postgres")]
use tokio_postgres::{Client, NoTls, Row};
#[cfg(feature = "postgres")]
use uuid::Uuid;

#[cfg(feature = "postgres")]
use crate::error::StoreError;
#[cfg(feature = "postgres")]
use crate::store::Store;
#[cfg(feature = "postgres")]
use crate::types::{
    AttemptId, AttemptStatus, DeliveryAttempt, DeliveryId, DeliveryStatus, Subscription,
    SubscriptionId, WebhookDelivery,
};

/// Postgres-backed store.
///
/// Three tables mirror the domain model. Deliveries intentionally carry
/// no foreign key to subscriptions so a delivery can outlive its
/// registration; workers handle the gone-subscription case themselves.
#[cfg(feature = "postgres")]
pub struct PostgresStore {
    client: Client,
}

#[cfg(feature = "postgres")]
impl PostgresStore {
    /// Wraps an established client, creating the schema if needed.
    pub async fn new(client: Client) -> Result<Self, tokio_postgres::Error> {
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS subscriptions (
                    id UUID PRIMARY KEY,
                    target_url TEXT NOT NULL,
                    secret_key TEXT,
                    event_types TEXT[] NOT NULL DEFAULT '{}',
                    created_at TIMESTAMPTZ NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL
                );
                CREATE TABLE IF NOT EXISTS webhook_deliveries (
                    id UUID PRIMARY KEY,
                    subscription_id UUID NOT NULL,
                    payload BYTEA NOT NULL,
                    event_type TEXT,
                    status TEXT NOT NULL,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    max_retries INTEGER NOT NULL,
                    next_retry_at TIMESTAMPTZ,
                    created_at TIMESTAMPTZ NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL
                );
                CREATE TABLE IF NOT EXISTS delivery_attempts (
                    id UUID PRIMARY KEY,
                    delivery_id UUID NOT NULL
                        REFERENCES webhook_deliveries(id) ON DELETE CASCADE,
                    attempt_number INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    status_code INTEGER,
                    error_details TEXT,
                    created_at TIMESTAMPTZ NOT NULL
                );
                CREATE INDEX IF NOT EXISTS webhook_deliveries_admission_idx
                    ON webhook_deliveries (status, next_retry_at, created_at);
                CREATE INDEX IF NOT EXISTS delivery_attempts_by_delivery_idx
                    ON delivery_attempts (delivery_id, attempt_number);",
            )
            .await?;

        Ok(Self { client })
    }

    /// Connects to the DSN and spawns the connection driver.
    pub async fn connect(dsn: &str) -> Result<Self, tokio_postgres::Error> {
        let (client, connection) = tokio_postgres::connect(dsn, NoTls).await?;
        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::error!(%error, "postgres connection terminated");
            }
        });
        Self::new(client).await
    }

    fn subscription_from_row(row: &Row) -> Result<Subscription, StoreError> {
        Ok(Subscription {
            id: SubscriptionId(row.try_get::<_, Uuid>("id").map_err(backend)?),
            target_url: row.try_get("target_url").map_err(backend)?,
            secret_key: row.try_get("secret_key").map_err(backend)?,
            event_types: row.try_get("event_types").map_err(backend)?,
            created_at: row.try_get("created_at").map_err(backend)?,
            updated_at: row.try_get("updated_at").map_err(backend)?,
        })
    }

    fn delivery_from_row(row: &Row) -> Result<WebhookDelivery, StoreError> {
        let status: String = row.try_get("status").map_err(backend)?;
        let status = DeliveryStatus::parse(&status)
            .ok_or_else(|| StoreError::Backend(format!("unknown delivery status {status:?}")))?;
        let retry_count: i32 = row.try_get("retry_count").map_err(backend)?;
        let max_retries: i32 = row.try_get("max_retries").map_err(backend)?;

        Ok(WebhookDelivery {
            id: DeliveryId(row.try_get::<_, Uuid>("id").map_err(backend)?),
            subscription_id: SubscriptionId(
                row.try_get::<_, Uuid>("subscription_id").map_err(backend)?,
            ),
            payload: row.try_get("payload").map_err(backend)?,
            event_type: row.try_get("event_type").map_err(backend)?,
            status,
            retry_count: retry_count.max(0) as u32,
            max_retries: max_retries.max(0) as u32,
            next_retry_at: row.try_get("next_retry_at").map_err(backend)?,
            created_at: row.try_get("created_at").map_err(backend)?,
            updated_at: row.try_get("updated_at").map_err(backend)?,
        })
    }

    fn attempt_from_row(row: &Row) -> Result<DeliveryAttempt, StoreError> {
        let status: String = row.try_get("status").map_err(backend)?;
        let status = AttemptStatus::parse(&status)
            .ok_or_else(|| StoreError::Backend(format!("unknown attempt status {status:?}")))?;
        let attempt_number: i32 = row.try_get("attempt_number").map_err(backend)?;
        let status_code: Option<i32> = row.try_get("status_code").map_err(backend)?;

        Ok(DeliveryAttempt {
            id: AttemptId(row.try_get::<_, Uuid>("id").map_err(backend)?),
            delivery_id: DeliveryId(row.try_get::<_, Uuid>("delivery_id").map_err(backend)?),
            attempt_number: attempt_number.max(0) as u32,
            status,
            status_code: status_code.and_then(|code| u16::try_from(code).ok()),
            error_details: row.try_get("error_details").map_err(backend)?,
            created_at: row.try_get("created_at").map_err(backend)?,
        })
    }
}

#[cfg(feature = "postgres")]
fn backend(err: tokio_postgres::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[cfg(feature = "postgres")]
fn is_unique_violation(err: &tokio_postgres::Error) -> bool {
    err.code() == Some(&SqlState::UNIQUE_VIOLATION)
}

#[cfg(feature = "postgres")]
#[async_trait]
impl Store for PostgresStore {
    async fn create_subscription(&self, subscription: &Subscription) -> Result<(), StoreError> {
        self.client
            .execute(
                "INSERT INTO subscriptions
                     (id, target_url, secret_key, event_types, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6)",
                &[
                    &subscription.id.0,
                    &subscription.target_url,
                    &subscription.secret_key,
                    &subscription.event_types,
                    &subscription.created_at,
                    &subscription.updated_at,
                ],
            )
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    StoreError::DuplicateSubscription(subscription.id)
                } else {
                    backend(err)
                }
            })?;
        Ok(())
    }

    async fn get_subscription(&self, id: SubscriptionId) -> Result<Subscription, StoreError> {
        let row = self
            .client
            .query_opt("SELECT * FROM subscriptions WHERE id = $1", &[&id.0])
            .await
            .map_err(backend)?
            .ok_or(StoreError::SubscriptionNotFound(id))?;
        Self::subscription_from_row(&row)
    }

    async fn update_subscription(&self, subscription: &Subscription) -> Result<(), StoreError> {
        let updated = self
            .client
            .execute(
                "UPDATE subscriptions
                 SET target_url = $2, secret_key = $3, event_types = $4, updated_at = $5
                 WHERE id = $1",
                &[
                    &subscription.id.0,
                    &subscription.target_url,
                    &subscription.secret_key,
                    &subscription.event_types,
                    &subscription.updated_at,
                ],
            )
            .await
            .map_err(backend)?;
        if updated == 0 {
            return Err(StoreError::SubscriptionNotFound(subscription.id));
        }
        Ok(())
    }

    async fn delete_subscription(&self, id: SubscriptionId) -> Result<(), StoreError> {
        let deleted = self
            .client
            .execute("DELETE FROM subscriptions WHERE id = $1", &[&id.0])
            .await
            .map_err(backend)?;
        if deleted == 0 {
            return Err(StoreError::SubscriptionNotFound(id));
        }
        Ok(())
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        let rows = self
            .client
            .query("SELECT * FROM subscriptions ORDER BY created_at DESC", &[])
            .await
            .map_err(backend)?;
        rows.iter().map(Self::subscription_from_row).collect()
    }

    async fn create_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError> {
        self.client
            .execute(
                "INSERT INTO webhook_deliveries
                     (id, subscription_id, payload, event_type, status, retry_count,
                      max_retries, next_retry_at, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
                &[
                    &delivery.id.0,
                    &delivery.subscription_id.0,
                    &delivery.payload,
                    &delivery.event_type,
                    &delivery.status.as_str(),
                    &(delivery.retry_count as i32),
                    &(delivery.max_retries as i32),
                    &delivery.next_retry_at,
                    &delivery.created_at,
                    &delivery.updated_at,
                ],
            )
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    StoreError::DuplicateDelivery(delivery.id)
                } else {
                    backend(err)
                }
            })?;
        Ok(())
    }

    async fn get_delivery(&self, id: DeliveryId) -> Result<WebhookDelivery, StoreError> {
        let row = self
            .client
            .query_opt("SELECT * FROM webhook_deliveries WHERE id = $1", &[&id.0])
            .await
            .map_err(backend)?
            .ok_or(StoreError::DeliveryNotFound(id))?;
        Self::delivery_from_row(&row)
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError> {
        let updated = self
            .client
            .execute(
                "UPDATE webhook_deliveries
                 SET status = $2, next_retry_at = $3, retry_count = $4, updated_at = $5
                 WHERE id = $1",
                &[
                    &delivery.id.0,
                    &delivery.status.as_str(),
                    &delivery.next_retry_at,
                    &(delivery.retry_count as i32),
                    &delivery.updated_at,
                ],
            )
            .await
            .map_err(backend)?;
        if updated == 0 {
            return Err(StoreError::DeliveryNotFound(delivery.id));
        }
        Ok(())
    }

    async fn mark_processing(
        &self,
        id: DeliveryId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let claimed = self
            .client
            .execute(
                "UPDATE webhook_deliveries
                 SET status = 'PROCESSING', updated_at = $2
                 WHERE id = $1 AND status = 'PENDING'",
                &[&id.0, &now],
            )
            .await
            .map_err(backend)?;
        Ok(claimed == 1)
    }

    async fn append_attempt(&self, attempt: &DeliveryAttempt) -> Result<(), StoreError> {
        let status_code = attempt.status_code.map(i32::from);
        self.client
            .execute(
                "INSERT INTO delivery_attempts
                     (id, delivery_id, attempt_number, status, status_code,
                      error_details, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &attempt.id.0,
                    &attempt.delivery_id.0,
                    &(attempt.attempt_number as i32),
                    &attempt.status.as_str(),
                    &status_code,
                    &attempt.error_details,
                    &attempt.created_at,
                ],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn list_attempts(
        &self,
        delivery_id: DeliveryId,
    ) -> Result<Vec<DeliveryAttempt>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT * FROM delivery_attempts
                 WHERE delivery_id = $1
                 ORDER BY attempt_number ASC",
                &[&delivery_id.0],
            )
            .await
            .map_err(backend)?;
        rows.iter().map(Self::attempt_from_row).collect()
    }

    async fn recent_deliveries(
        &self,
        subscription_id: SubscriptionId,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT * FROM webhook_deliveries
                 WHERE subscription_id = $1
                 ORDER BY created_at DESC
                 LIMIT $2",
                &[&subscription_id.0, &(limit as i64)],
            )
            .await
            .map_err(backend)?;
        rows.iter().map(Self::delivery_from_row).collect()
    }

    async fn due_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT * FROM webhook_deliveries
                 WHERE status = 'PENDING'
                   AND (next_retry_at IS NULL OR next_retry_at <= $1)
                 ORDER BY created_at ASC
                 LIMIT $2",
                &[&now, &(limit as i64)],
            )
            .await
            .map_err(backend)?;
        rows.iter().map(Self::delivery_from_row).collect()
    }

    async fn stale_processing(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT * FROM webhook_deliveries
                 WHERE status = 'PROCESSING' AND updated_at <= $1
                 ORDER BY updated_at ASC
                 LIMIT $2",
                &[&cutoff, &(limit as i64)],
            )
            .await
            .map_err(backend)?;
        rows.iter().map(Self::delivery_from_row).collect()
    }

    async fn delete_attempts_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.client
            .execute("DELETE FROM delivery_attempts WHERE created_at < $1", &[&cutoff])
            .await
            .map_err(backend)
    }
}
