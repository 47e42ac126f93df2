use std::fmt;

use crate::types::{DeliveryId, SubscriptionId};

/// Errors surfaced by the persistence layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No subscription row with this id.
    SubscriptionNotFound(SubscriptionId),

    /// No delivery row with this id.
    DeliveryNotFound(DeliveryId),

    /// Insert collided with an existing delivery id.
    DuplicateDelivery(DeliveryId),

    /// Insert collided with an existing subscription id.
    DuplicateSubscription(SubscriptionId),

    /// Backend unreachable or a query failed.
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::SubscriptionNotFound(id) => {
                write!(f, "subscription not found: {id}")
            }
            StoreError::DeliveryNotFound(id) => {
                write!(f, "delivery not found: {id}")
            }
            StoreError::DuplicateDelivery(id) => {
                write!(f, "delivery already exists: {id}")
            }
            StoreError::DuplicateSubscription(id) => {
                write!(f, "subscription already exists: {id}")
            }
            StoreError::Backend(detail) => {
                write!(f, "store backend error: {detail}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors surfaced by the task queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The queue no longer accepts work.
    Shutdown,

    /// Backend unreachable or a command failed.
    Backend(String),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Shutdown => write!(f, "queue is shut down"),
            QueueError::Backend(detail) => write!(f, "queue backend error: {detail}"),
        }
    }
}

impl std::error::Error for QueueError {}

/// Errors rejected at configuration load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment value did not parse.
    Invalid { var: &'static str, value: String },

    /// A retry budget above one needs at least one backoff delay.
    EmptyRetryDelays,

    /// The pool needs at least one worker.
    NoWorkers,

    /// An unacked task would be redelivered while its attempt is still
    /// in flight.
    VisibilityBelowDispatchTimeout,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => {
                write!(f, "invalid value for {var}: {value:?}")
            }
            ConfigError::EmptyRetryDelays => {
                write!(f, "retry_delays must not be empty when retry_limit > 1")
            }
            ConfigError::NoWorkers => {
                write!(f, "worker_concurrency must be at least 1")
            }
            ConfigError::VisibilityBelowDispatchTimeout => {
                write!(f, "visibility_timeout must be at least dispatch_timeout")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Errors surfaced by admission and the admin-facing operations.
///
/// Once a delivery row exists, dispatch failures stop being errors: they
/// are absorbed by the worker as attempt records and state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CourierError {
    SubscriptionNotFound(SubscriptionId),
    DeliveryNotFound(DeliveryId),

    /// The supplied signature did not match the subscription secret.
    InvalidSignature,

    /// The subscription requires signed payloads and none was supplied.
    MissingSignature,

    /// The destination URL did not parse or uses an unsupported scheme.
    InvalidTargetUrl(String),

    Store(StoreError),
    Queue(QueueError),
}

impl fmt::Display for CourierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CourierError::SubscriptionNotFound(id) => {
                write!(f, "subscription not found: {id}")
            }
            CourierError::DeliveryNotFound(id) => {
                write!(f, "delivery not found: {id}")
            }
            CourierError::InvalidSignature => write!(f, "invalid signature"),
            CourierError::MissingSignature => write!(f, "missing signature"),
            CourierError::InvalidTargetUrl(url) => {
                write!(f, "invalid target url: {url:?}")
            }
            CourierError::Store(err) => write!(f, "{err}"),
            CourierError::Queue(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for CourierError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CourierError::Store(err) => Some(err),
            CourierError::Queue(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for CourierError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SubscriptionNotFound(id) => CourierError::SubscriptionNotFound(id),
            StoreError::DeliveryNotFound(id) => CourierError::DeliveryNotFound(id),
            other => CourierError::Store(other),
        }
    }
}

impl From<QueueError> for CourierError {
    fn from(err: QueueError) -> Self {
        CourierError::Queue(err)
    }
}

/// Result of one HTTP invocation of a destination.
///
/// Dispatch never returns `Err`: every outcome becomes an attempt record
/// and drives the retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The destination answered with a 2xx status.
    Success { status_code: u16 },

    /// The destination answered with a non-2xx status.
    HttpFailure {
        status_code: u16,
        /// First slice of the response body, bounded for the audit log.
        body_prefix: String,
    },

    /// The request never produced a response (DNS, TLS, connect, timeout).
    TransportFailure { error: String },
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DispatchOutcome::Success { .. })
    }

    /// Status code, when the destination responded at all.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            DispatchOutcome::Success { status_code }
            | DispatchOutcome::HttpFailure { status_code, .. } => Some(*status_code),
            DispatchOutcome::TransportFailure { .. } => None,
        }
    }

    /// Error text for the attempt record, absent on success.
    pub fn error_details(&self) -> Option<String> {
        match self {
            DispatchOutcome::Success { .. } => None,
            DispatchOutcome::HttpFailure {
                status_code,
                body_prefix,
            } => Some(format!("HTTP {status_code}: {body_prefix}")),
            DispatchOutcome::TransportFailure { error } => Some(error.clone()),
        }
    }
}
