//! Instance registry admin + connection-state ingestion.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde_json::{Value, json};

use crate::events::EventKind;
use crate::instances::{self, ConnectionUpdateRequest, CreateInstanceRequest, Instance};
use crate::registry::ConnectionState;
use crate::state::AppState;

use super::{ApiError, db_create_error, internal};

#[utoipa::path(post, path = "/instance", tag = "instances",
    request_body = CreateInstanceRequest,
    responses((status = 201, description = "Instance registered", body = Instance)))]
pub async fn create_instance(
    State(state): State<AppState>,
    Json(req): Json<CreateInstanceRequest>,
) -> Result<(StatusCode, Json<Instance>), ApiError> {
    if !instances::is_valid_name(&req.name) {
        return Err(ApiError::BadRequest(
            "instance name must match [a-zA-Z0-9_-]{1,100}".into(),
        ));
    }
    let base = url::Url::parse(&req.base_url)
        .map_err(|e| ApiError::BadRequest(format!("invalid baseUrl: {}", e)))?;
    if base.scheme() != "http" && base.scheme() != "https" {
        return Err(ApiError::BadRequest("baseUrl scheme must be http or https".into()));
    }

    let row = instances::insert(&state.db, &req)
        .await
        .map_err(|e| db_create_error(e, "instance"))?;

    // New workers report closed until the first health sweep or
    // connection update says otherwise.
    state.registry.set_state(&row.name, ConnectionState::Close);
    state.emit_event(
        EventKind::InstanceCreate,
        json!({ "name": row.name, "baseUrl": row.base_url }),
        Some(row.name.clone()),
    );

    tracing::info!("instance registered: {} at {}", row.name, row.base_url);
    Ok((
        StatusCode::CREATED,
        Json(Instance::from_row(&row, ConnectionState::Close.as_str())),
    ))
}

#[utoipa::path(get, path = "/instance", tag = "instances",
    responses((status = 200, description = "All instances with live state")))]
pub async fn list_instances(
    State(state): State<AppState>,
) -> Result<Json<Vec<Instance>>, ApiError> {
    let rows = instances::list_all(&state.db)
        .await
        .map_err(|e| internal("failed to list instances", e))?;
    Ok(Json(
        rows.iter()
            .map(|row| Instance::from_row(row, state.registry.state(&row.name).as_str()))
            .collect(),
    ))
}

#[utoipa::path(delete, path = "/instance/{name}", tag = "instances",
    params(("name" = String, Path, description = "Instance name")),
    responses((status = 200, description = "Instance removed")))]
pub async fn delete_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let deleted = instances::delete_by_name(&state.db, &name)
        .await
        .map_err(|e| internal("failed to delete instance", e))?;
    if !deleted {
        return Err(ApiError::NotFound(format!("instance {} not found", name)));
    }

    state.registry.remove(&name);
    state.emit_event(
        EventKind::InstanceDelete,
        json!({ "name": name }),
        Some(name.clone()),
    );
    crate::audit::log_audit(
        &state.db,
        "delete_instance",
        json!({ "name": name }),
        None,
    )
    .await;

    Ok(Json(json!({ "status": "deleted", "name": name })))
}

/// Monitoring-collaborator ingestion: a worker (or its supervisor)
/// reports a connection transition.
#[utoipa::path(patch, path = "/instance/{name}/connection", tag = "instances",
    request_body = ConnectionUpdateRequest,
    params(("name" = String, Path, description = "Instance name")),
    responses((status = 200, description = "State recorded")))]
pub async fn update_connection(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<ConnectionUpdateRequest>,
) -> Result<Json<Value>, ApiError> {
    let next = ConnectionState::parse(&req.state).ok_or_else(|| {
        ApiError::BadRequest("state must be one of open, connecting, close".into())
    })?;

    let row = instances::get_by_name(&state.db, &name)
        .await
        .map_err(|e| internal("failed to load instance", e))?
        .ok_or_else(|| ApiError::NotFound(format!("instance {} not found", name)))?;

    state.registry.set_state(&row.name, next);
    state.emit_event(
        EventKind::ConnectionUpdate,
        json!({ "name": row.name, "state": next.as_str() }),
        Some(row.name.clone()),
    );

    tracing::info!("instance {}: connection -> {}", row.name, next);
    Ok(Json(json!({ "name": row.name, "state": next.as_str() })))
}
