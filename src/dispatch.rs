//! Outbound HTTP dispatch of delivery payloads.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::DispatchOutcome;
use crate::signing;
use crate::types::{Subscription, WebhookDelivery};

/// Maximum bytes of a failure response body kept for the attempt log.
const BODY_PREFIX_LIMIT: usize = 2048;

/// Seam between workers and the network.
///
/// Dispatch is infallible by construction: every call produces an
/// outcome, and the worker turns that outcome into an attempt record.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(
        &self,
        delivery: &WebhookDelivery,
        subscription: &Subscription,
    ) -> DispatchOutcome;
}

/// reqwest-backed dispatcher.
///
/// Posts the payload bytes verbatim with the delivery headers, signs
/// when the subscription carries a secret, never follows redirects, and
/// bounds each attempt by a single deadline covering connect, write and
/// read.
pub struct HttpDispatcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpDispatcher {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("default TLS backend is available");
        Self { client, timeout }
    }
}

#[async_trait]
impl Dispatch for HttpDispatcher {
    async fn dispatch(
        &self,
        delivery: &WebhookDelivery,
        subscription: &Subscription,
    ) -> DispatchOutcome {
        let mut request = self
            .client
            .post(&subscription.target_url)
            .timeout(self.timeout)
            .header("Content-Type", "application/json")
            .header("X-Webhook-ID", delivery.id.to_string())
            .body(delivery.payload.clone());

        if let Some(event_type) = &delivery.event_type {
            request = request.header("X-Webhook-Event", event_type);
        }
        if let Some(secret) = subscription.signing_secret() {
            request = request.header(
                "X-Hub-Signature-256",
                signing::sign(&delivery.payload, secret),
            );
        }

        match request.send().await {
            Ok(response) => {
                let status_code = response.status().as_u16();
                if (200..300).contains(&status_code) {
                    DispatchOutcome::Success { status_code }
                } else {
                    DispatchOutcome::HttpFailure {
                        status_code,
                        body_prefix: read_body_prefix(response).await,
                    }
                }
            }
            Err(err) => DispatchOutcome::TransportFailure {
                error: err.to_string(),
            },
        }
    }
}

/// Reads at most `BODY_PREFIX_LIMIT` bytes of a failure body.
///
/// Framing errors mid-stream truncate what was collected so far; the
/// full body is never buffered.
async fn read_body_prefix(mut response: reqwest::Response) -> String {
    let mut collected: Vec<u8> = Vec::new();
    while collected.len() < BODY_PREFIX_LIMIT {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let remaining = BODY_PREFIX_LIMIT - collected.len();
                collected.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
            }
            Ok(None) | Err(_) => break,
        }
    }
    String::from_utf8_lossy(&collected).into_owned()
}
