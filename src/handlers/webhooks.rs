//! External webhook subscriber endpoints.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::events::EventKind;
use crate::state::AppState;
use crate::webhooks::{
    self, CreateWebhookRequest, DEFAULT_TIMEOUT_MS, UpdateWebhookRequest, Webhook,
};

use super::{ApiError, db_create_error, internal, parse_uuid};

fn validate_configs(
    url: &str,
    events: &[String],
    retry: &webhooks::RetryConfig,
    security: &webhooks::SecurityConfig,
    timeout_ms: i32,
    dev_mode: bool,
) -> Result<(), ApiError> {
    webhooks::validate_url(url, dev_mode).map_err(ApiError::BadRequest)?;
    webhooks::validate_events(events).map_err(ApiError::BadRequest)?;
    retry.validate().map_err(ApiError::BadRequest)?;
    security.validate().map_err(ApiError::BadRequest)?;
    webhooks::validate_timeout(timeout_ms).map_err(ApiError::BadRequest)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
//  Create / list
// ═══════════════════════════════════════════════════════════════════════

#[utoipa::path(post, path = "/external-webhook", tag = "webhooks",
    request_body = CreateWebhookRequest,
    responses((status = 201, description = "Webhook created")))]
pub async fn create_webhook(
    State(state): State<AppState>,
    Json(req): Json<CreateWebhookRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if req.name.is_empty() {
        return Err(ApiError::BadRequest("name must be non-empty".into()));
    }
    validate_configs(
        &req.url,
        &req.events,
        &req.retry_config,
        &req.security_config,
        req.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
        state.dev_mode,
    )?;

    let row = webhooks::insert(&state.db, &req)
        .await
        .map_err(|e| db_create_error(e, "webhook"))?;

    crate::audit::log_audit(
        &state.db,
        "create_webhook",
        json!({ "id": row.id.to_string(), "name": row.name }),
        None,
    )
    .await;

    tracing::info!("webhook created: {} -> {}", row.name, row.url);
    Ok((StatusCode::CREATED, Json(row.to_api())))
}

#[utoipa::path(get, path = "/external-webhook", tag = "webhooks",
    responses((status = 200, description = "All webhooks")))]
pub async fn list_webhooks(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let rows = webhooks::list_all(&state.db)
        .await
        .map_err(|e| internal("failed to list webhooks", e))?;
    Ok(Json(Value::Array(
        rows.iter().map(|r| r.to_api()).collect(),
    )))
}

#[utoipa::path(get, path = "/external-webhook/{id}", tag = "webhooks",
    params(("id" = String, Path, description = "Webhook UUID")),
    responses((status = 200, description = "Webhook by id")))]
pub async fn get_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_uuid(&id)?;
    let row = webhooks::get_by_id(&state.db, id)
        .await
        .map_err(|e| internal("failed to load webhook", e))?
        .ok_or_else(|| ApiError::NotFound(format!("webhook {} not found", id)))?;
    Ok(Json(row.to_api()))
}

// ═══════════════════════════════════════════════════════════════════════
//  Update / toggle / delete
// ═══════════════════════════════════════════════════════════════════════

#[utoipa::path(put, path = "/external-webhook/{id}", tag = "webhooks",
    params(("id" = String, Path, description = "Webhook UUID")),
    request_body = UpdateWebhookRequest,
    responses((status = 200, description = "Updated webhook")))]
pub async fn update_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateWebhookRequest>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_uuid(&id)?;
    let mut row = webhooks::get_by_id(&state.db, id)
        .await
        .map_err(|e| internal("failed to load webhook", e))?
        .ok_or_else(|| ApiError::NotFound(format!("webhook {} not found", id)))?;

    if let Some(name) = req.name {
        if name.is_empty() {
            return Err(ApiError::BadRequest("name must be non-empty".into()));
        }
        row.name = name;
    }
    if let Some(url) = req.url {
        row.url = url;
    }
    if let Some(enabled) = req.enabled {
        row.enabled = enabled;
    }
    if let Some(description) = req.description {
        row.description = Some(description);
    }
    if let Some(events) = req.events {
        row.events.0 = events;
    }
    if let Some(headers) = req.headers {
        row.headers.0 = headers;
    }
    if let Some(auth) = req.authentication {
        row.authentication.0 = auth;
    }
    if let Some(retry) = req.retry_config {
        row.retry_config.0 = retry;
    }
    if let Some(security) = req.security_config {
        row.security_config.0 = security;
    }
    if let Some(filter) = req.filter_config {
        row.filter_config.0 = filter;
    }
    if let Some(timeout_ms) = req.timeout_ms {
        row.timeout_ms = timeout_ms;
    }

    validate_configs(
        &row.url,
        &row.events.0,
        &row.retry_config.0,
        &row.security_config.0,
        row.timeout_ms,
        state.dev_mode,
    )?;

    let row = webhooks::update(&state.db, &row)
        .await
        .map_err(|e| db_create_error(e, "webhook"))?
        .ok_or_else(|| ApiError::NotFound(format!("webhook {} not found", id)))?;
    Ok(Json(row.to_api()))
}

#[utoipa::path(patch, path = "/external-webhook/{id}/toggle", tag = "webhooks",
    params(("id" = String, Path, description = "Webhook UUID")),
    responses((status = 200, description = "Enabled flag flipped")))]
pub async fn toggle_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_uuid(&id)?;
    let row = webhooks::toggle(&state.db, id)
        .await
        .map_err(|e| internal("failed to toggle webhook", e))?
        .ok_or_else(|| ApiError::NotFound(format!("webhook {} not found", id)))?;

    tracing::info!(
        "webhook {}: {}",
        row.name,
        if row.enabled { "enabled" } else { "disabled" }
    );
    Ok(Json(json!({ "id": row.id.to_string(), "enabled": row.enabled })))
}

#[utoipa::path(delete, path = "/external-webhook/{id}", tag = "webhooks",
    params(("id" = String, Path, description = "Webhook UUID")),
    responses((status = 200, description = "Webhook deleted")))]
pub async fn delete_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_uuid(&id)?;
    let deleted = webhooks::delete(&state.db, id)
        .await
        .map_err(|e| internal("failed to delete webhook", e))?;
    if !deleted {
        return Err(ApiError::NotFound(format!("webhook {} not found", id)));
    }

    state.breakers.forget(id);
    crate::audit::log_audit(
        &state.db,
        "delete_webhook",
        json!({ "id": id.to_string() }),
        None,
    )
    .await;

    Ok(Json(json!({ "status": "deleted", "id": id.to_string() })))
}

// ═══════════════════════════════════════════════════════════════════════
//  Stats / test delivery
// ═══════════════════════════════════════════════════════════════════════

#[utoipa::path(get, path = "/external-webhook/{id}/stats", tag = "webhooks",
    params(("id" = String, Path, description = "Webhook UUID")),
    responses((status = 200, description = "Execution statistics")))]
pub async fn webhook_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_uuid(&id)?;
    let row = webhooks::get_by_id(&state.db, id)
        .await
        .map_err(|e| internal("failed to load webhook", e))?
        .ok_or_else(|| ApiError::NotFound(format!("webhook {} not found", id)))?;

    Ok(Json(json!({
        "id": row.id.to_string(),
        "name": row.name,
        "circuitState": state.breakers.state(row.id).as_str(),
        "stats": row.stats_json(),
    })))
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct TestWebhookRequest {
    /// Event kind to emit; defaults to APPLICATION_STARTUP.
    pub event: Option<String>,
    pub data: Option<Value>,
}

#[utoipa::path(post, path = "/external-webhook/{id}/test", tag = "webhooks",
    request_body = TestWebhookRequest,
    params(("id" = String, Path, description = "Webhook UUID")),
    responses((status = 200, description = "Delivery outcome")))]
pub async fn test_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<TestWebhookRequest>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_uuid(&id)?;
    let row = webhooks::get_by_id(&state.db, id)
        .await
        .map_err(|e| internal("failed to load webhook", e))?
        .ok_or_else(|| ApiError::NotFound(format!("webhook {} not found", id)))?;

    let event = match req.event.as_deref() {
        Some(raw) => EventKind::parse(raw)
            .ok_or_else(|| ApiError::BadRequest(format!("unknown event kind: {}", raw)))?,
        None => EventKind::ApplicationStartup,
    };
    let payload = req.data.unwrap_or_else(|| json!({ "test": true }));

    // Inline delivery (not fire-and-forget) so the caller sees the outcome.
    let outcome = state
        .dispatcher
        .deliver(Webhook::from(&row), event, payload, None)
        .await;

    Ok(Json(json!({
        "id": row.id.to_string(),
        "event": event.as_str(),
        "outcome": outcome,
    })))
}
