//! Backend instance records — the registry's durable backing store.
//!
//! Membership validation for groups resolves against this table; live
//! connection state is the in-memory `InstanceRegistry`.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

pub const MAX_NAME_LEN: usize = 100;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InstanceRow {
    pub id: Uuid,
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub enabled: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// API view; `state` is filled from the registry, never stored.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub enabled: bool,
    pub state: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Instance {
    pub fn from_row(row: &InstanceRow, state: &str) -> Self {
        Self {
            id: row.id.to_string(),
            name: row.name.clone(),
            base_url: row.base_url.clone(),
            enabled: row.enabled,
            state: state.to_string(),
            created_at: row.created_at.to_rfc3339(),
            updated_at: row.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceRequest {
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct ConnectionUpdateRequest {
    pub state: String,
}

pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

// ── Repository ──────────────────────────────────────────────────────────

const INSTANCE_COLUMNS: &str = "id, name, base_url, api_key, enabled, created_at, updated_at";

pub async fn list_all(db: &PgPool) -> Result<Vec<InstanceRow>, sqlx::Error> {
    sqlx::query_as::<_, InstanceRow>(&format!(
        "SELECT {INSTANCE_COLUMNS} FROM rp_instances ORDER BY name"
    ))
    .fetch_all(db)
    .await
}

pub async fn get_by_name(db: &PgPool, name: &str) -> Result<Option<InstanceRow>, sqlx::Error> {
    sqlx::query_as::<_, InstanceRow>(&format!(
        "SELECT {INSTANCE_COLUMNS} FROM rp_instances WHERE name = $1"
    ))
    .bind(name)
    .fetch_optional(db)
    .await
}

/// Which of `names` exist in the backing store. Used by group
/// create/update to reject unknown members in one round trip.
pub async fn existing_names(db: &PgPool, names: &[String]) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>("SELECT name FROM rp_instances WHERE name = ANY($1)")
        .bind(names)
        .fetch_all(db)
        .await
}

pub async fn insert(db: &PgPool, req: &CreateInstanceRequest) -> Result<InstanceRow, sqlx::Error> {
    sqlx::query_as::<_, InstanceRow>(&format!(
        "INSERT INTO rp_instances (name, base_url, api_key, enabled) \
         VALUES ($1, $2, $3, $4) RETURNING {INSTANCE_COLUMNS}"
    ))
    .bind(&req.name)
    .bind(&req.base_url)
    .bind(&req.api_key)
    .bind(req.enabled.unwrap_or(true))
    .fetch_one(db)
    .await
}

pub async fn delete_by_name(db: &PgPool, name: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM rp_instances WHERE name = $1")
        .bind(name)
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_charset() {
        assert!(is_valid_name("worker-01"));
        assert!(is_valid_name("Sales_Pool_2"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("has space"));
        assert!(!is_valid_name("emoji✨"));
        assert!(!is_valid_name(&"x".repeat(101)));
    }
}
