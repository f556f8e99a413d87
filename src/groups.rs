//! Instance-group records: model, validation, and DB access.
//!
//! A group is a named, aliased pool of backend instance names used by the
//! balancer. Name and alias uniqueness is enforced by DB unique
//! constraints; handlers translate violations to 400s.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_ALIAS_LEN: usize = 100;
pub const MAX_DESCRIPTION_LEN: usize = 500;

// ── Models ──────────────────────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
pub struct GroupRow {
    pub id: Uuid,
    pub name: String,
    pub alias: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub instances: Json<Vec<String>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// API view of a group.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroup {
    pub id: String,
    pub name: String,
    pub alias: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub enabled: bool,
    pub instances: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<GroupRow> for InstanceGroup {
    fn from(row: GroupRow) -> Self {
        Self {
            id: row.id.to_string(),
            name: row.name,
            alias: row.alias,
            description: row.description,
            enabled: row.enabled,
            instances: row.instances.0,
            created_at: row.created_at.to_rfc3339(),
            updated_at: row.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupRequest {
    pub name: String,
    /// Defaults to `transform_to_alias(name)` when omitted.
    pub alias: Option<String>,
    pub description: Option<String>,
    pub enabled: Option<bool>,
    pub instances: Vec<String>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateGroupRequest {
    pub name: Option<String>,
    pub alias: Option<String>,
    pub description: Option<String>,
    pub enabled: Option<bool>,
    pub instances: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MemberRequest {
    pub instance_name: String,
}

// ── Alias handling ──────────────────────────────────────────────────────

/// Derive a URL-safe alias: lowercase, whitespace/underscores become
/// hyphens, anything outside `[a-z0-9-]` is dropped, runs of hyphens
/// collapse, leading/trailing hyphens are trimmed. Idempotent.
pub fn transform_to_alias(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_hyphen = true; // swallow leading hyphens
    for c in input.chars() {
        let c = match c {
            'A'..='Z' => c.to_ascii_lowercase(),
            'a'..='z' | '0'..='9' => c,
            ' ' | '\t' | '_' | '-' => '-',
            _ => continue,
        };
        if c == '-' {
            if !last_hyphen {
                out.push('-');
                last_hyphen = true;
            }
        } else {
            out.push(c);
            last_hyphen = false;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

pub fn is_valid_alias(alias: &str) -> bool {
    !alias.is_empty()
        && alias.len() <= MAX_ALIAS_LEN
        && alias
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Field-level validation shared by create and update. Returns the first
/// problem found as a message for a 400 response.
pub fn validate_fields(
    name: Option<&str>,
    alias: Option<&str>,
    description: Option<&str>,
) -> Result<(), String> {
    if let Some(name) = name {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(format!("name must be 1-{} characters", MAX_NAME_LEN));
        }
    }
    if let Some(alias) = alias {
        if !is_valid_alias(alias) {
            return Err(format!(
                "alias must match [a-z0-9-]+ and be 1-{} characters",
                MAX_ALIAS_LEN
            ));
        }
    }
    if let Some(desc) = description {
        if desc.len() > MAX_DESCRIPTION_LEN {
            return Err(format!(
                "description must be at most {} characters",
                MAX_DESCRIPTION_LEN
            ));
        }
    }
    Ok(())
}

/// Membership list validation: non-empty and duplicate-free. Existence
/// of each member is checked against the instance table by the caller.
pub fn validate_membership(instances: &[String]) -> Result<(), String> {
    if instances.is_empty() {
        return Err("instances must contain at least one instance name".into());
    }
    for (i, name) in instances.iter().enumerate() {
        if name.is_empty() {
            return Err("instance names must be non-empty".into());
        }
        if instances[..i].contains(name) {
            return Err(format!("duplicate instance name: {}", name));
        }
    }
    Ok(())
}

// ── Repository ──────────────────────────────────────────────────────────

const GROUP_COLUMNS: &str =
    "id, name, alias, description, enabled, instances, created_at, updated_at";

pub async fn list_all(db: &PgPool) -> Result<Vec<GroupRow>, sqlx::Error> {
    sqlx::query_as::<_, GroupRow>(&format!(
        "SELECT {GROUP_COLUMNS} FROM rp_instance_groups ORDER BY name"
    ))
    .fetch_all(db)
    .await
}

pub async fn get_by_id(db: &PgPool, id: Uuid) -> Result<Option<GroupRow>, sqlx::Error> {
    sqlx::query_as::<_, GroupRow>(&format!(
        "SELECT {GROUP_COLUMNS} FROM rp_instance_groups WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(db)
    .await
}

pub async fn get_by_name(db: &PgPool, name: &str) -> Result<Option<GroupRow>, sqlx::Error> {
    sqlx::query_as::<_, GroupRow>(&format!(
        "SELECT {GROUP_COLUMNS} FROM rp_instance_groups WHERE name = $1"
    ))
    .bind(name)
    .fetch_optional(db)
    .await
}

pub async fn get_by_alias(db: &PgPool, alias: &str) -> Result<Option<GroupRow>, sqlx::Error> {
    sqlx::query_as::<_, GroupRow>(&format!(
        "SELECT {GROUP_COLUMNS} FROM rp_instance_groups WHERE alias = $1"
    ))
    .bind(alias)
    .fetch_optional(db)
    .await
}

pub async fn insert(
    db: &PgPool,
    name: &str,
    alias: &str,
    description: Option<&str>,
    enabled: bool,
    instances: &[String],
) -> Result<GroupRow, sqlx::Error> {
    sqlx::query_as::<_, GroupRow>(&format!(
        "INSERT INTO rp_instance_groups (name, alias, description, enabled, instances) \
         VALUES ($1, $2, $3, $4, $5) RETURNING {GROUP_COLUMNS}"
    ))
    .bind(name)
    .bind(alias)
    .bind(description)
    .bind(enabled)
    .bind(Json(instances))
    .fetch_one(db)
    .await
}

pub async fn update(
    db: &PgPool,
    id: Uuid,
    name: &str,
    alias: &str,
    description: Option<&str>,
    enabled: bool,
    instances: &[String],
) -> Result<Option<GroupRow>, sqlx::Error> {
    sqlx::query_as::<_, GroupRow>(&format!(
        "UPDATE rp_instance_groups \
         SET name = $1, alias = $2, description = $3, enabled = $4, instances = $5, \
             updated_at = NOW() \
         WHERE id = $6 RETURNING {GROUP_COLUMNS}"
    ))
    .bind(name)
    .bind(alias)
    .bind(description)
    .bind(enabled)
    .bind(Json(instances))
    .bind(id)
    .fetch_optional(db)
    .await
}

pub async fn set_instances(
    db: &PgPool,
    id: Uuid,
    instances: &[String],
) -> Result<Option<GroupRow>, sqlx::Error> {
    sqlx::query_as::<_, GroupRow>(&format!(
        "UPDATE rp_instance_groups SET instances = $1, updated_at = NOW() \
         WHERE id = $2 RETURNING {GROUP_COLUMNS}"
    ))
    .bind(Json(instances))
    .bind(id)
    .fetch_optional(db)
    .await
}

pub async fn delete(db: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM rp_instance_groups WHERE id = $1")
        .bind(id)
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Group summary used by the membership-health endpoint.
pub fn membership_stats(group: &GroupRow, states: Vec<(String, String)>) -> Value {
    let open = states.iter().filter(|(_, s)| s == "open").count();
    serde_json::json!({
        "groupId": group.id.to_string(),
        "groupAlias": group.alias,
        "enabled": group.enabled,
        "totalInstances": group.instances.0.len(),
        "activeInstances": open,
        "instances": states
            .into_iter()
            .map(|(name, state)| serde_json::json!({
                "name": name,
                "state": state,
                "open": state == "open",
            }))
            .collect::<Vec<_>>(),
    })
}
