//! Instance-group CRUD and membership operations.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde_json::{Value, json};

use crate::groups::{
    self, CreateGroupRequest, InstanceGroup, MemberRequest, UpdateGroupRequest,
};
use crate::instances;
use crate::state::AppState;

use super::{ApiError, db_create_error, internal, parse_uuid};

/// Every member must exist in the instance backing store.
async fn ensure_members_exist(state: &AppState, members: &[String]) -> Result<(), ApiError> {
    let known = instances::existing_names(&state.db, members)
        .await
        .map_err(|e| internal("failed to check instances", e))?;
    for name in members {
        if !known.contains(name) {
            return Err(ApiError::BadRequest(format!("unknown instance: {}", name)));
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
//  Create / list
// ═══════════════════════════════════════════════════════════════════════

#[utoipa::path(post, path = "/instance-group", tag = "groups",
    request_body = CreateGroupRequest,
    responses((status = 201, description = "Group created", body = InstanceGroup)))]
pub async fn create_group(
    State(state): State<AppState>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<InstanceGroup>), ApiError> {
    let alias = req
        .alias
        .clone()
        .unwrap_or_else(|| groups::transform_to_alias(&req.name));

    groups::validate_fields(Some(&req.name), Some(&alias), req.description.as_deref())
        .map_err(ApiError::BadRequest)?;
    groups::validate_membership(&req.instances).map_err(ApiError::BadRequest)?;
    ensure_members_exist(&state, &req.instances).await?;

    let row = groups::insert(
        &state.db,
        &req.name,
        &alias,
        req.description.as_deref(),
        req.enabled.unwrap_or(true),
        &req.instances,
    )
    .await
    .map_err(|e| db_create_error(e, "group"))?;

    crate::audit::log_audit(
        &state.db,
        "create_group",
        json!({ "id": row.id.to_string(), "alias": row.alias }),
        None,
    )
    .await;

    tracing::info!(
        "group created: {} (alias={}, {} instances)",
        row.name,
        row.alias,
        row.instances.0.len()
    );
    Ok((StatusCode::CREATED, Json(row.into())))
}

#[utoipa::path(get, path = "/instance-group", tag = "groups",
    responses((status = 200, description = "All groups")))]
pub async fn list_groups(
    State(state): State<AppState>,
) -> Result<Json<Vec<InstanceGroup>>, ApiError> {
    let rows = groups::list_all(&state.db)
        .await
        .map_err(|e| internal("failed to list groups", e))?;
    Ok(Json(rows.into_iter().map(InstanceGroup::from).collect()))
}

// ═══════════════════════════════════════════════════════════════════════
//  Lookups
// ═══════════════════════════════════════════════════════════════════════

#[utoipa::path(get, path = "/instance-group/{id}", tag = "groups",
    params(("id" = String, Path, description = "Group UUID")),
    responses((status = 200, description = "Group by id", body = InstanceGroup)))]
pub async fn get_group(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceGroup>, ApiError> {
    let id = parse_uuid(&id)?;
    let row = groups::get_by_id(&state.db, id)
        .await
        .map_err(|e| internal("failed to load group", e))?
        .ok_or_else(|| ApiError::NotFound(format!("group {} not found", id)))?;
    Ok(Json(row.into()))
}

#[utoipa::path(get, path = "/instance-group/name/{name}", tag = "groups",
    params(("name" = String, Path, description = "Group name")),
    responses((status = 200, description = "Group by name", body = InstanceGroup)))]
pub async fn get_group_by_name(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<InstanceGroup>, ApiError> {
    let row = groups::get_by_name(&state.db, &name)
        .await
        .map_err(|e| internal("failed to load group", e))?
        .ok_or_else(|| ApiError::NotFound(format!("group named {:?} not found", name)))?;
    Ok(Json(row.into()))
}

#[utoipa::path(get, path = "/instance-group/alias/{alias}", tag = "groups",
    params(("alias" = String, Path, description = "Group alias")),
    responses((status = 200, description = "Group by alias", body = InstanceGroup)))]
pub async fn get_group_by_alias(
    State(state): State<AppState>,
    Path(alias): Path<String>,
) -> Result<Json<InstanceGroup>, ApiError> {
    let row = groups::get_by_alias(&state.db, &alias)
        .await
        .map_err(|e| internal("failed to load group", e))?
        .ok_or_else(|| ApiError::NotFound(format!("group with alias {:?} not found", alias)))?;
    Ok(Json(row.into()))
}

// ═══════════════════════════════════════════════════════════════════════
//  Update / delete
// ═══════════════════════════════════════════════════════════════════════

#[utoipa::path(put, path = "/instance-group/{id}", tag = "groups",
    params(("id" = String, Path, description = "Group UUID")),
    request_body = UpdateGroupRequest,
    responses((status = 200, description = "Updated group", body = InstanceGroup)))]
pub async fn update_group(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateGroupRequest>,
) -> Result<Json<InstanceGroup>, ApiError> {
    let id = parse_uuid(&id)?;
    let current = groups::get_by_id(&state.db, id)
        .await
        .map_err(|e| internal("failed to load group", e))?
        .ok_or_else(|| ApiError::NotFound(format!("group {} not found", id)))?;

    let name = req.name.unwrap_or(current.name);
    let alias = req.alias.unwrap_or(current.alias);
    let description = req.description.or(current.description);
    let enabled = req.enabled.unwrap_or(current.enabled);
    let instances = req.instances.unwrap_or(current.instances.0);

    groups::validate_fields(Some(&name), Some(&alias), description.as_deref())
        .map_err(ApiError::BadRequest)?;
    groups::validate_membership(&instances).map_err(ApiError::BadRequest)?;
    ensure_members_exist(&state, &instances).await?;

    let row = groups::update(
        &state.db,
        id,
        &name,
        &alias,
        description.as_deref(),
        enabled,
        &instances,
    )
    .await
    .map_err(|e| db_create_error(e, "group"))?
    .ok_or_else(|| ApiError::NotFound(format!("group {} not found", id)))?;

    Ok(Json(row.into()))
}

#[utoipa::path(delete, path = "/instance-group/{id}", tag = "groups",
    params(("id" = String, Path, description = "Group UUID")),
    responses((status = 200, description = "Group deleted")))]
pub async fn delete_group(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_uuid(&id)?;
    let deleted = groups::delete(&state.db, id)
        .await
        .map_err(|e| internal("failed to delete group", e))?;
    if !deleted {
        return Err(ApiError::NotFound(format!("group {} not found", id)));
    }

    crate::audit::log_audit(
        &state.db,
        "delete_group",
        json!({ "id": id.to_string() }),
        None,
    )
    .await;

    Ok(Json(json!({ "status": "deleted", "id": id.to_string() })))
}

// ═══════════════════════════════════════════════════════════════════════
//  Membership operations
// ═══════════════════════════════════════════════════════════════════════

#[utoipa::path(post, path = "/instance-group/{id}/addInstance", tag = "groups",
    params(("id" = String, Path, description = "Group UUID")),
    request_body = MemberRequest,
    responses((status = 200, description = "Member added", body = InstanceGroup)))]
pub async fn add_group_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<MemberRequest>,
) -> Result<Json<InstanceGroup>, ApiError> {
    let id = parse_uuid(&id)?;
    let group = groups::get_by_id(&state.db, id)
        .await
        .map_err(|e| internal("failed to load group", e))?
        .ok_or_else(|| ApiError::NotFound(format!("group {} not found", id)))?;

    let name = req.instance_name;
    if group.instances.0.contains(&name) {
        return Err(ApiError::BadRequest(format!(
            "instance {} is already a member",
            name
        )));
    }
    ensure_members_exist(&state, std::slice::from_ref(&name)).await?;

    let mut members = group.instances.0;
    members.push(name.clone());
    let row = groups::set_instances(&state.db, id, &members)
        .await
        .map_err(|e| internal("failed to update membership", e))?
        .ok_or_else(|| ApiError::NotFound(format!("group {} not found", id)))?;

    tracing::info!("group {}: added instance {}", row.alias, name);
    Ok(Json(row.into()))
}

#[utoipa::path(post, path = "/instance-group/{id}/removeInstance", tag = "groups",
    params(("id" = String, Path, description = "Group UUID")),
    request_body = MemberRequest,
    responses((status = 200, description = "Member removed", body = InstanceGroup)))]
pub async fn remove_group_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<MemberRequest>,
) -> Result<Json<InstanceGroup>, ApiError> {
    let id = parse_uuid(&id)?;
    let group = groups::get_by_id(&state.db, id)
        .await
        .map_err(|e| internal("failed to load group", e))?
        .ok_or_else(|| ApiError::NotFound(format!("group {} not found", id)))?;

    let name = req.instance_name;
    if !group.instances.0.contains(&name) {
        return Err(ApiError::BadRequest(format!(
            "instance {} is not a member",
            name
        )));
    }
    if group.instances.0.len() == 1 {
        return Err(ApiError::BadRequest(
            "cannot remove the last instance from a group".into(),
        ));
    }

    let members: Vec<String> = group
        .instances
        .0
        .into_iter()
        .filter(|m| *m != name)
        .collect();
    let row = groups::set_instances(&state.db, id, &members)
        .await
        .map_err(|e| internal("failed to update membership", e))?
        .ok_or_else(|| ApiError::NotFound(format!("group {} not found", id)))?;

    tracing::info!("group {}: removed instance {}", row.alias, name);
    Ok(Json(row.into()))
}

// ═══════════════════════════════════════════════════════════════════════
//  Membership health
// ═══════════════════════════════════════════════════════════════════════

#[utoipa::path(get, path = "/instance-group/{id}/activeInstances", tag = "groups",
    params(("id" = String, Path, description = "Group UUID")),
    responses((status = 200, description = "Members currently open")))]
pub async fn active_instances(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_uuid(&id)?;
    let group = groups::get_by_id(&state.db, id)
        .await
        .map_err(|e| internal("failed to load group", e))?
        .ok_or_else(|| ApiError::NotFound(format!("group {} not found", id)))?;

    let active = state.registry.open_subset(&group.instances.0);
    let count = active.len();
    Ok(Json(json!({
        "groupId": group.id.to_string(),
        "activeInstances": active,
        "count": count,
    })))
}

#[utoipa::path(get, path = "/instance-group/{id}/stats", tag = "groups",
    params(("id" = String, Path, description = "Group UUID")),
    responses((status = 200, description = "Membership health")))]
pub async fn group_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_uuid(&id)?;
    let group = groups::get_by_id(&state.db, id)
        .await
        .map_err(|e| internal("failed to load group", e))?
        .ok_or_else(|| ApiError::NotFound(format!("group {} not found", id)))?;

    let states: Vec<(String, String)> = group
        .instances
        .0
        .iter()
        .map(|name| (name.clone(), state.registry.state(name).to_string()))
        .collect();
    Ok(Json(groups::membership_stats(&group, states)))
}
