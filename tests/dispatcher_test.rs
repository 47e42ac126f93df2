//! HTTP dispatcher behavior against a local stub destination.

use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use webhook_courier::{
    sign, Dispatch, DispatchOutcome, HttpDispatcher, Subscription, WebhookDelivery,
};

struct CapturedRequest {
    head: String,
    body: Vec<u8>,
}

impl CapturedRequest {
    fn has_header(&self, name: &str) -> bool {
        let needle = format!("{}:", name.to_ascii_lowercase());
        self.head
            .lines()
            .any(|line| line.to_ascii_lowercase().starts_with(&needle))
    }

    fn header(&self, name: &str) -> Option<String> {
        let needle = name.to_ascii_lowercase();
        self.head.lines().find_map(|line| {
            let (header, value) = line.split_once(':')?;
            if header.trim().to_ascii_lowercase() == needle {
                Some(value.trim().to_string())
            } else {
                None
            }
        })
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Serves exactly one request with a fixed response and returns what the
/// client sent.
async fn stub_destination(
    status_line: &'static str,
    body: &'static str,
) -> (String, JoinHandle<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/hook", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        let mut buffer = Vec::new();
        let mut chunk = [0u8; 1024];
        let header_end = loop {
            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client hung up before finishing headers");
            buffer.extend_from_slice(&chunk[..n]);
            if let Some(position) = find_subsequence(&buffer, b"\r\n\r\n") {
                break position + 4;
            }
        };

        let head = String::from_utf8_lossy(&buffer[..header_end]).into_owned();
        let content_length = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                if name.trim().eq_ignore_ascii_case("content-length") {
                    value.trim().parse::<usize>().ok()
                } else {
                    None
                }
            })
            .unwrap_or(0);

        while buffer.len() < header_end + content_length {
            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client hung up before finishing the body");
            buffer.extend_from_slice(&chunk[..n]);
        }

        let response = format!(
            "HTTP/1.1 {status_line}\r\nContent-Length: {}\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n{body}",
            body.len(),
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.ok();

        CapturedRequest {
            head,
            body: buffer[header_end..].to_vec(),
        }
    });

    (url, handle)
}

fn delivery_for(subscription: &Subscription, event_type: Option<&str>) -> WebhookDelivery {
    WebhookDelivery::new(
        subscription.id,
        br#"{"k":"v"}"#.to_vec(),
        event_type.map(str::to_string),
        5,
        Utc::now(),
    )
}

#[tokio::test]
async fn success_sends_signed_payload_with_delivery_headers() {
    let (url, server) = stub_destination("200 OK", "ok").await;
    let subscription = Subscription::new(url, Utc::now()).with_secret("s3cr3t");
    let delivery = delivery_for(&subscription, Some("order.created"));

    let dispatcher = HttpDispatcher::new(Duration::from_secs(10));
    let outcome = dispatcher.dispatch(&delivery, &subscription).await;
    assert_eq!(outcome, DispatchOutcome::Success { status_code: 200 });

    let request = server.await.unwrap();
    assert!(request.head.starts_with("POST /hook HTTP/1.1"));
    assert_eq!(request.body, delivery.payload);
    assert_eq!(
        request.header("content-type").as_deref(),
        Some("application/json")
    );
    assert_eq!(
        request.header("x-webhook-id"),
        Some(delivery.id.to_string())
    );
    assert_eq!(
        request.header("x-webhook-event").as_deref(),
        Some("order.created")
    );
    assert_eq!(
        request.header("x-hub-signature-256"),
        Some(sign(&delivery.payload, "s3cr3t"))
    );
}

#[tokio::test]
async fn optional_headers_are_omitted_without_secret_or_event_type() {
    let (url, server) = stub_destination("204 No Content", "").await;
    let subscription = Subscription::new(url, Utc::now());
    let delivery = delivery_for(&subscription, None);

    let dispatcher = HttpDispatcher::new(Duration::from_secs(10));
    let outcome = dispatcher.dispatch(&delivery, &subscription).await;
    assert_eq!(outcome, DispatchOutcome::Success { status_code: 204 });

    let request = server.await.unwrap();
    assert!(request.has_header("x-webhook-id"));
    assert!(!request.has_header("x-webhook-event"));
    assert!(!request.has_header("x-hub-signature-256"));
}

#[tokio::test]
async fn non_2xx_captures_status_and_body_prefix() {
    let (url, server) = stub_destination("500 Internal Server Error", "database is down").await;
    let subscription = Subscription::new(url, Utc::now());
    let delivery = delivery_for(&subscription, None);

    let dispatcher = HttpDispatcher::new(Duration::from_secs(10));
    let outcome = dispatcher.dispatch(&delivery, &subscription).await;

    assert_eq!(
        outcome,
        DispatchOutcome::HttpFailure {
            status_code: 500,
            body_prefix: "database is down".to_string(),
        }
    );
    assert_eq!(
        outcome.error_details().as_deref(),
        Some("HTTP 500: database is down")
    );
    server.await.unwrap();
}

#[tokio::test]
async fn unreachable_destination_is_a_transport_failure() {
    // Bind then drop to get a port with nothing listening.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/hook", listener.local_addr().unwrap());
    drop(listener);

    let subscription = Subscription::new(url, Utc::now());
    let delivery = delivery_for(&subscription, None);

    let dispatcher = HttpDispatcher::new(Duration::from_secs(10));
    let outcome = dispatcher.dispatch(&delivery, &subscription).await;

    assert!(
        matches!(outcome, DispatchOutcome::TransportFailure { .. }),
        "expected transport failure, got {outcome:?}"
    );
    assert_eq!(outcome.status_code(), None);
}
