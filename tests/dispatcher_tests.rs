//! Delivery-loop tests against in-process HTTP targets.
//!
//! Each test spins up a real axum server on a loopback port with a
//! scripted status sequence, then drives `WebhookDispatcher::deliver`
//! directly. Stats writes hit the lazy test pool and are absorbed by the
//! recorder, so no database is needed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use hmac::{Hmac, Mac};

use relaypool_backend::breaker::CircuitBreakerSet;
use relaypool_backend::dispatcher::WebhookDispatcher;
use relaypool_backend::events::EventKind;
use relaypool_backend::webhooks::{
    AuthenticationConfig, FilterConfig, RetryConfig, SecurityConfig, SignatureAlgorithm, Webhook,
};

struct Target {
    url: String,
    hits: Arc<AtomicUsize>,
    last_headers: Arc<Mutex<Option<HeaderMap>>>,
    last_body: Arc<Mutex<Vec<u8>>>,
}

/// Serve a scripted status sequence on a random loopback port. Requests
/// past the end of the script repeat the final status.
async fn spawn_target(statuses: Vec<u16>) -> Target {
    let hits = Arc::new(AtomicUsize::new(0));
    let last_headers = Arc::new(Mutex::new(None));
    let last_body = Arc::new(Mutex::new(Vec::new()));

    let hits_h = hits.clone();
    let headers_h = last_headers.clone();
    let body_h = last_body.clone();

    let app = axum::Router::new().route(
        "/hook",
        post(move |headers: HeaderMap, body: Bytes| {
            let n = hits_h.fetch_add(1, Ordering::SeqCst);
            *headers_h.lock().unwrap() = Some(headers);
            *body_h.lock().unwrap() = body.to_vec();
            let status = statuses
                .get(n)
                .or(statuses.last())
                .copied()
                .unwrap_or(200);
            async move { StatusCode::from_u16(status).unwrap() }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Target {
        url: format!("http://{}/hook", addr),
        hits,
        last_headers,
        last_body,
    }
}

fn dispatcher_with(breakers: Arc<CircuitBreakerSet>) -> WebhookDispatcher {
    let db = sqlx::PgPool::connect_lazy("postgres://test@localhost:19999/test").unwrap();
    WebhookDispatcher::new(db, reqwest::Client::new(), breakers)
}

fn dispatcher() -> WebhookDispatcher {
    dispatcher_with(Arc::new(CircuitBreakerSet::new()))
}

fn hook(url: &str, retry: RetryConfig) -> Webhook {
    Webhook {
        id: uuid::Uuid::new_v4(),
        name: "test-hook".into(),
        url: url.to_string(),
        enabled: true,
        description: None,
        events: vec![],
        headers: Default::default(),
        authentication: AuthenticationConfig::None,
        retry_config: retry,
        security_config: SecurityConfig::default(),
        filter_config: FilterConfig::default(),
        timeout_ms: 5_000,
    }
}

fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay_seconds: 1,
        use_exponential_backoff: true,
        max_delay_seconds: 4,
        jitter_factor: 0.0,
        non_retryable_status_codes: vec![],
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  Retry loop
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn retries_until_success_with_backoff() {
    let target = spawn_target(vec![500, 500, 200]).await;
    let d = dispatcher();

    let started = Instant::now();
    let outcome = d
        .deliver(
            hook(&target.url, fast_retry(3)),
            EventKind::SendMessage,
            serde_json::json!({ "n": 1 }),
            Some("worker-a".into()),
        )
        .await;

    assert!(outcome.success, "expected success, got {:?}", outcome.error);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(target.hits.load(Ordering::SeqCst), 3);
    // Sleeps of ~1s then ~2s between the three attempts.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(2900), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(6), "elapsed {:?}", elapsed);
}

#[tokio::test]
async fn non_retryable_status_gets_exactly_one_request() {
    let target = spawn_target(vec![404]).await;
    let d = dispatcher();

    let retry = RetryConfig {
        non_retryable_status_codes: vec![404],
        ..fast_retry(3)
    };
    let outcome = d
        .deliver(
            hook(&target.url, retry),
            EventKind::SendMessage,
            serde_json::json!({}),
            None,
        )
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(target.hits.load(Ordering::SeqCst), 1);
    assert!(outcome.error.unwrap().contains("404"));
}

#[tokio::test]
async fn total_requests_bounded_by_max_attempts() {
    let target = spawn_target(vec![500]).await;
    let d = dispatcher();

    let outcome = d
        .deliver(
            hook(&target.url, fast_retry(2)),
            EventKind::Call,
            serde_json::json!({}),
            None,
        )
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(target.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn timeout_is_a_retryable_failure() {
    // Nothing listens on this port: connection errors behave like
    // timeouts for the retry loop.
    let d = dispatcher();
    let mut h = hook("http://127.0.0.1:9/hook", fast_retry(1));
    h.timeout_ms = 1_000;

    let outcome = d
        .deliver(h, EventKind::Errors, serde_json::json!({}), None)
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.attempts, 1);
    assert!(outcome.error.is_some());
}

// ═══════════════════════════════════════════════════════════════════════════
//  Circuit breaker coupling
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn breaker_opens_after_five_failures_and_blocks_requests() {
    let target = spawn_target(vec![500]).await;
    let breakers = Arc::new(CircuitBreakerSet::new());
    let d = dispatcher_with(breakers.clone());

    let h = hook(&target.url, fast_retry(1));
    for _ in 0..5 {
        let outcome = d
            .deliver(h.clone(), EventKind::SendMessage, serde_json::json!({}), None)
            .await;
        assert!(!outcome.success);
    }
    assert_eq!(target.hits.load(Ordering::SeqCst), 5);

    // Sixth delivery: circuit is open, zero HTTP requests issued.
    let outcome = d
        .deliver(h.clone(), EventKind::SendMessage, serde_json::json!({}), None)
        .await;
    assert!(!outcome.success);
    assert_eq!(outcome.attempts, 0);
    assert_eq!(outcome.error.as_deref(), Some("circuit breaker open"));
    assert_eq!(target.hits.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn breaker_allows_probe_after_cooldown() {
    let target = spawn_target(vec![500, 500, 200]).await;
    let breakers = Arc::new(CircuitBreakerSet::with_config(2, Duration::from_millis(150)));
    let d = dispatcher_with(breakers.clone());

    let h = hook(&target.url, fast_retry(1));
    for _ in 0..2 {
        d.deliver(h.clone(), EventKind::SendMessage, serde_json::json!({}), None)
            .await;
    }
    assert_eq!(target.hits.load(Ordering::SeqCst), 2);

    // Open: skipped without a request.
    let outcome = d
        .deliver(h.clone(), EventKind::SendMessage, serde_json::json!({}), None)
        .await;
    assert_eq!(outcome.attempts, 0);
    assert_eq!(target.hits.load(Ordering::SeqCst), 2);

    tokio::time::sleep(Duration::from_millis(200)).await;

    // Half-open probe goes through and closes the circuit on 200.
    let outcome = d
        .deliver(h.clone(), EventKind::SendMessage, serde_json::json!({}), None)
        .await;
    assert!(outcome.success);
    assert_eq!(target.hits.load(Ordering::SeqCst), 3);
    assert!(breakers.allow(h.id));
}

// ═══════════════════════════════════════════════════════════════════════════
//  Wire format
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn envelope_carries_event_instance_and_webhook_identity() {
    let target = spawn_target(vec![200]).await;
    let d = dispatcher();

    let h = hook(&target.url, fast_retry(1));
    let hook_id = h.id;
    d.deliver(
        h,
        EventKind::ConnectionUpdate,
        serde_json::json!({ "state": "open" }),
        Some("worker-a".into()),
    )
    .await;

    let body = target.last_body.lock().unwrap().clone();
    let envelope: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(envelope["event"], "CONNECTION_UPDATE");
    assert_eq!(envelope["instance"], "worker-a");
    assert_eq!(envelope["data"]["state"], "open");
    assert_eq!(envelope["webhook"]["id"], hook_id.to_string());
    assert_eq!(envelope["webhook"]["name"], "test-hook");
    assert!(envelope["timestamp"].as_str().unwrap().contains('T'));
}

#[tokio::test]
async fn auth_and_custom_headers_reach_the_wire() {
    let target = spawn_target(vec![200]).await;
    let d = dispatcher();

    let mut h = hook(&target.url, fast_retry(1));
    h.authentication = AuthenticationConfig::Bearer {
        token: "wire-token".into(),
    };
    h.headers.insert("X-Tenant".into(), "acme".into());

    d.deliver(h, EventKind::SendMessage, serde_json::json!({}), None)
        .await;

    let headers = target.last_headers.lock().unwrap().clone().unwrap();
    assert_eq!(headers["authorization"], "Bearer wire-token");
    assert_eq!(headers["x-tenant"], "acme");
    assert_eq!(headers["content-type"], "application/json");
}

#[tokio::test]
async fn hmac_signature_matches_received_body() {
    let target = spawn_target(vec![200]).await;
    let d = dispatcher();

    let mut h = hook(&target.url, fast_retry(1));
    h.security_config = SecurityConfig {
        enable_signature_validation: true,
        signature_secret: Some("0123456789abcdef".into()),
        signature_header: "X-Webhook-Signature".into(),
        signature_algorithm: SignatureAlgorithm::Sha256,
    };

    d.deliver(h, EventKind::SendMessage, serde_json::json!({ "ping": 1 }), None)
        .await;

    let headers = target.last_headers.lock().unwrap().clone().unwrap();
    let body = target.last_body.lock().unwrap().clone();

    // Receiver-side verification: recompute over the raw bytes received.
    let mut mac = Hmac::<sha2::Sha256>::new_from_slice(b"0123456789abcdef").unwrap();
    mac.update(&body);
    let expected = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
    assert_eq!(headers["x-webhook-signature"], expected.as_str());
}
