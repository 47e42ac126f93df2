//! A durable, at-least-once webhook delivery pipeline.
//!
//! Callers register **subscriptions** (destination URLs with optional
//! shared secrets and event-type filters), then submit event payloads.
//! Each accepted payload becomes a **delivery**: a durable row plus a
//! queued task that a worker pool drives through signed HTTP dispatch,
//! exponential-backoff retries and a full per-attempt audit log.
//!
//! ## Guarantees
//! - At-least-once delivery: every accepted payload reaches its
//!   destination at least once on success paths
//! - Durability across restarts: admission survives a crash between
//!   enqueue and dispatch
//! - Full audit: one append-only attempt row per HTTP invocation
//! - Bounded retry budgets and bounded failure-body capture
//!
//! ## Non-Guarantees
//! - Exactly-once delivery (subscribers deduplicate on `X-Webhook-ID`)
//! - Ordering across deliveries of one subscription
//! - Fan-out to multiple destinations per event
//! - Payload transformation or inspection
//!
//! The crate is the delivery core only: the REST admin surface, process
//! bootstrap and logging setup are the embedding service's business.
//! [`Courier`] is the front half (admission and queries) and
//! [`Pipeline`] the back half (workers, recovery, retention); both run
//! against pluggable [`Store`] and [`TaskQueue`] backends.

mod cache;
mod clock;
mod config;
mod dispatch;
mod error;
mod metrics;
mod queue;
mod reconcile;
mod retention;
mod retry;
mod service;
mod signing;
mod store;
mod types;
mod worker;

#[cfg(feature = "postgres")]
mod store_postgres;

#[cfg(feature = "redis")]
mod queue_redis;

pub use cache::SubscriptionCache;
pub use clock::{Clock, SimulatedClock, SystemClock};
pub use config::{parse_delay_list, parse_duration, CourierConfig};
pub use dispatch::{Dispatch, HttpDispatcher};
pub use error::{ConfigError, CourierError, DispatchOutcome, QueueError, StoreError};
pub use queue::{InMemoryQueue, LeaseId, LeasedTask, TaskQueue};
pub use reconcile::Reconciler;
pub use retention::RetentionSweeper;
pub use retry::{RetryDecision, RetryPolicy};
pub use service::{Courier, IngestOutcome};
pub use signing::{sign, verify, SIGNATURE_PREFIX};
pub use store::{InMemoryStore, Store};
pub use types::{
    validate_target_url, AttemptId, AttemptStatus, DeliveryAttempt, DeliveryId, DeliveryStatus,
    Subscription, SubscriptionId, WebhookDelivery,
};
pub use worker::{Pipeline, WorkerContext, WorkerPool};

#[cfg(feature = "postgres")]
pub use store_postgres::PostgresStore;

#[cfg(feature = "redis")]
pub use queue_redis::RedisQueue;
