use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a subscription.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of subscription ids with other UUIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

/// Unique identifier for a delivery.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of delivery ids with other UUIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeliveryId(pub Uuid);

/// Unique identifier for a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttemptId(pub Uuid);

macro_rules! id_impls {
    ($name:ident) => {
        impl $name {
            /// Generates a fresh random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

id_impls!(SubscriptionId);
id_impls!(DeliveryId);
id_impls!(AttemptId);

/// Destination registration for webhook delivery.
///
/// A `Subscription` describes *where* payloads go and *which* events the
/// destination wants. It is owned by the admin surface and read-only for
/// the delivery pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// Immutable identifier, assigned at creation.
    pub id: SubscriptionId,

    /// Absolute destination URL (http or https).
    pub target_url: String,

    /// Optional shared secret. Presence enables payload signing on
    /// dispatch and signature verification on ingestion.
    pub secret_key: Option<String>,

    /// Accepted event types. Empty means "accept all".
    pub event_types: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Create a subscription with a fresh id and no secret or filter.
    pub fn new(target_url: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: SubscriptionId::new(),
            target_url: target_url.into(),
            secret_key: None,
            event_types: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Set a shared secret for signing and verification.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret_key = Some(secret.into());
        self
    }

    /// Restrict the subscription to the given event types.
    pub fn with_event_types<I, S>(mut self, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = event_types.into_iter().map(Into::into).collect();
        self
    }

    /// Whether an incoming event passes this subscription's filter.
    ///
    /// An empty filter accepts everything, and an event without a type
    /// bypasses the filter entirely.
    pub fn accepts_event(&self, event_type: Option<&str>) -> bool {
        match event_type {
            Some(event_type) if !self.event_types.is_empty() => {
                self.event_types.iter().any(|t| t == event_type)
            }
            _ => true,
        }
    }

    /// The secret to sign with, if one is configured and non-empty.
    pub fn signing_secret(&self) -> Option<&str> {
        self.secret_key.as_deref().filter(|s| !s.is_empty())
    }
}

/// Checks that a destination URL parses and uses a scheme the dispatcher
/// can reach.
pub fn validate_target_url(raw: &str) -> bool {
    match url::Url::parse(raw) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https"),
        Err(_) => false,
    }
}

/// Lifecycle state of a delivery.
///
/// `Delivered` and `Failed` are absorbing: no further transitions and no
/// further enqueues happen once a delivery reaches either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    /// Persisted string form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Delivered => "DELIVERED",
            Self::Failed => "FAILED",
        }
    }

    /// Parses the persisted string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PROCESSING" => Some(Self::Processing),
            "DELIVERED" => Some(Self::Delivered),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One accepted event targeting one subscription; the unit of retry.
///
/// The payload is opaque JSON bytes carried verbatim from ingestion to
/// dispatch so that re-signing is bit-identical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: DeliveryId,
    pub subscription_id: SubscriptionId,

    /// Opaque payload bytes, never parsed by the pipeline.
    pub payload: Vec<u8>,

    /// Event type captured from the ingestion header, when present.
    pub event_type: Option<String>,

    pub status: DeliveryStatus,

    /// Completed *failed* attempts. A successful final attempt does not
    /// increment this.
    pub retry_count: u32,

    /// Total attempt budget, copied from config at creation.
    pub max_retries: u32,

    /// Earliest time a worker may process the delivery when `Pending`.
    pub next_retry_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    /// Touched on every state mutation; drives the stale-claim sweep.
    pub updated_at: DateTime<Utc>,
}

impl WebhookDelivery {
    /// Create a fresh delivery in `Pending` with an untouched retry budget.
    pub fn new(
        subscription_id: SubscriptionId,
        payload: Vec<u8>,
        event_type: Option<String>,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeliveryId::new(),
            subscription_id,
            payload,
            event_type,
            status: DeliveryStatus::Pending,
            retry_count: 0,
            max_retries,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Outcome of one attempt row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AttemptStatus {
    Success,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUCCESS" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit record of one HTTP invocation of a destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: AttemptId,
    pub delivery_id: DeliveryId,

    /// 1-based; equals the delivery's `retry_count + 1` at the moment the
    /// attempt starts.
    pub attempt_number: u32,

    pub status: AttemptStatus,

    /// HTTP status code, when the request produced a response.
    pub status_code: Option<u16>,

    /// Network error text or `HTTP <code>: <body-prefix>`.
    pub error_details: Option<String>,

    /// When the attempt completed.
    pub created_at: DateTime<Utc>,
}

impl DeliveryAttempt {
    /// Record for an attempt that received a 2xx response.
    pub fn succeeded(
        delivery_id: DeliveryId,
        attempt_number: u32,
        status_code: u16,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AttemptId::new(),
            delivery_id,
            attempt_number,
            status: AttemptStatus::Success,
            status_code: Some(status_code),
            error_details: None,
            created_at: completed_at,
        }
    }

    /// Record for a failed attempt, with or without a response.
    pub fn failed(
        delivery_id: DeliveryId,
        attempt_number: u32,
        status_code: Option<u16>,
        error_details: String,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AttemptId::new(),
            delivery_id,
            attempt_number,
            status: AttemptStatus::Failed,
            status_code,
            error_details: Some(error_details),
            created_at: completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(event_types: &[&str]) -> Subscription {
        Subscription::new("https://example.test/hook", Utc::now())
            .with_event_types(event_types.iter().copied())
    }

    #[test]
    fn empty_filter_accepts_all() {
        assert!(sub(&[]).accepts_event(Some("order.created")));
        assert!(sub(&[]).accepts_event(None));
    }

    #[test]
    fn typed_event_must_match_filter() {
        let s = sub(&["order.created", "order.paid"]);
        assert!(s.accepts_event(Some("order.created")));
        assert!(!s.accepts_event(Some("order.cancelled")));
    }

    #[test]
    fn untyped_event_bypasses_filter() {
        assert!(sub(&["order.created"]).accepts_event(None));
    }

    #[test]
    fn target_url_validation() {
        assert!(validate_target_url("https://example.test/hook"));
        assert!(validate_target_url("http://localhost:8080/"));
        assert!(!validate_target_url("ftp://example.test/"));
        assert!(!validate_target_url("not a url"));
        assert!(!validate_target_url(""));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            DeliveryStatus::Pending,
            DeliveryStatus::Processing,
            DeliveryStatus::Delivered,
            DeliveryStatus::Failed,
        ] {
            assert_eq!(DeliveryStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DeliveryStatus::parse("pending"), None);
        assert!(DeliveryStatus::Delivered.is_terminal());
        assert!(DeliveryStatus::Failed.is_terminal());
        assert!(!DeliveryStatus::Pending.is_terminal());
    }

    #[test]
    fn empty_secret_is_not_a_signing_secret() {
        let mut s = sub(&[]);
        assert!(s.signing_secret().is_none());
        s.secret_key = Some(String::new());
        assert!(s.signing_secret().is_none());
        s.secret_key = Some("s3cr3t".into());
        assert_eq!(s.signing_secret(), Some("s3cr3t"));
    }
}
