// Relaypool — application state

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use redis::aio::ConnectionManager;
use sqlx::PgPool;

use crate::balancer::Balancer;
use crate::breaker::CircuitBreakerSet;
use crate::dispatcher::WebhookDispatcher;
use crate::events::EventKind;
use crate::registry::InstanceRegistry;
use crate::rotation::RotationStore;

/// Central application state. Clone-friendly — PgPool and Arc are both Clone.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub http_client: reqwest::Client,
    pub registry: Arc<InstanceRegistry>,
    pub rotation: Arc<RotationStore>,
    pub balancer: Arc<Balancer>,
    pub breakers: Arc<CircuitBreakerSet>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub start_time: Instant,
    /// `true` once the registry warm-up completes (or times out).
    pub ready: Arc<AtomicBool>,
    /// Optional api key from AUTH_API_KEY env. None = dev mode (no auth).
    pub api_key: Option<String>,
    /// SERVER_MODE=development relaxes the webhook-URL private-range check.
    pub dev_mode: bool,
}

impl AppState {
    pub fn new(db: PgPool, redis: Option<ConnectionManager>) -> Self {
        let api_key = std::env::var("AUTH_API_KEY").ok().filter(|s| !s.is_empty());
        if api_key.is_some() {
            tracing::info!("AUTH_API_KEY configured — authentication enabled");
        } else {
            tracing::info!("AUTH_API_KEY not set — authentication disabled (dev mode)");
        }

        let dev_mode = std::env::var("SERVER_MODE")
            .map(|m| m.eq_ignore_ascii_case("development"))
            .unwrap_or(false);

        let http_client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .timeout(std::time::Duration::from_secs(120))
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .expect("Failed to build HTTP client");

        let rotation = Arc::new(RotationStore::new(redis));
        if rotation.has_cache() {
            tracing::info!("rotation store: Redis cache attached, in-memory fallback armed");
        } else {
            tracing::warn!("rotation store: no Redis configured — in-memory rotation only");
        }

        let registry = Arc::new(InstanceRegistry::new());
        let balancer = Arc::new(Balancer::new(
            db.clone(),
            rotation.clone(),
            registry.clone(),
        ));
        let breakers = Arc::new(CircuitBreakerSet::new());
        let dispatcher = Arc::new(WebhookDispatcher::new(
            db.clone(),
            http_client.clone(),
            breakers.clone(),
        ));

        Self {
            db,
            http_client,
            registry,
            rotation,
            balancer,
            breakers,
            dispatcher,
            start_time: Instant::now(),
            ready: Arc::new(AtomicBool::new(false)),
            api_key,
            dev_mode,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
        tracing::info!("Gateway marked as READY");
    }

    /// Emit a domain event to webhook subscribers without blocking the
    /// calling request. Delivery outcomes land in stats and logs only.
    pub fn emit_event(&self, event: EventKind, payload: serde_json::Value, instance: Option<String>) {
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            dispatcher.dispatch(event, payload, instance).await;
        });
    }

    /// Test-only constructor — uses `connect_lazy` so no real DB is
    /// needed, no Redis, no auth. Only suitable for endpoints that don't
    /// issue SQL queries (or that gracefully handle DB errors).
    #[doc(hidden)]
    pub fn new_test() -> Self {
        let db = PgPool::connect_lazy("postgres://test@localhost:19999/test").expect("lazy pool");

        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .expect("Failed to build HTTP client");

        let rotation = Arc::new(RotationStore::new(None));
        let registry = Arc::new(InstanceRegistry::new());
        let balancer = Arc::new(Balancer::new(
            db.clone(),
            rotation.clone(),
            registry.clone(),
        ));
        let breakers = Arc::new(CircuitBreakerSet::new());
        let dispatcher = Arc::new(WebhookDispatcher::new(
            db.clone(),
            http_client.clone(),
            breakers.clone(),
        ));

        Self {
            db,
            http_client,
            registry,
            rotation,
            balancer,
            breakers,
            dispatcher,
            start_time: Instant::now(),
            ready: Arc::new(AtomicBool::new(false)),
            api_key: None,
            dev_mode: false,
        }
    }
}
