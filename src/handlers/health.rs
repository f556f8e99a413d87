//! Health, readiness, and metrics endpoints. All public (no auth).

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde_json::{Value, json};

use crate::state::AppState;

#[utoipa::path(get, path = "/api/health", tag = "health",
    responses((status = 200, description = "Gateway health summary")))]
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let status = if state.is_ready() { "ok" } else { "starting" };
    Json(json!({
        "status": status,
        "app": "Relaypool",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "rotation_cache": if state.rotation.has_cache() { "redis" } else { "memory" },
        "auth_required": state.api_key.is_some(),
    }))
}

#[utoipa::path(get, path = "/api/health/ready", tag = "health",
    responses(
        (status = 200, description = "Ready to serve"),
        (status = 503, description = "Still starting")))]
pub async fn readiness(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if state.is_ready() {
        Ok(Json(json!({ "ready": true })))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

/// Prometheus-compatible text metrics.
pub async fn metrics_handler(State(state): State<AppState>) -> String {
    let uptime = state.start_time.elapsed().as_secs();
    let (dispatched, delivered, failed) = state.dispatcher.counters();
    let open_breakers = state.breakers.open_count();
    format!(
        "# HELP uptime_seconds Gateway uptime in seconds\n\
         # TYPE uptime_seconds counter\n\
         uptime_seconds {}\n\
         # HELP webhook_events_dispatched_total Events fanned out to subscribers\n\
         # TYPE webhook_events_dispatched_total counter\n\
         webhook_events_dispatched_total {}\n\
         # HELP webhook_deliveries_success_total Successful webhook deliveries\n\
         # TYPE webhook_deliveries_success_total counter\n\
         webhook_deliveries_success_total {}\n\
         # HELP webhook_deliveries_failed_total Failed webhook deliveries\n\
         # TYPE webhook_deliveries_failed_total counter\n\
         webhook_deliveries_failed_total {}\n\
         # HELP webhook_circuits_open Currently open circuit breakers\n\
         # TYPE webhook_circuits_open gauge\n\
         webhook_circuits_open {}\n",
        uptime, dispatched, delivered, failed, open_breakers,
    )
}
