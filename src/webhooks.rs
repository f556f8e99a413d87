//! External webhook subscribers: model, config validation, DB access,
//! and the execution-stats recorder.
//!
//! The discriminated config records (authentication, security) are tagged
//! serde enums/structs stored as JSONB, so per-variant required fields are
//! enforced at deserialization time.

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::events::EventKind;

// ── Config records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AuthenticationConfig {
    #[default]
    None,
    Bearer {
        token: String,
    },
    Basic {
        user: String,
        pass: String,
    },
    ApiKey {
        token: String,
        header: String,
    },
    Jwt {
        secret: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SignatureAlgorithm {
    Sha256,
    Sha1,
    Md5,
}

impl SignatureAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureAlgorithm::Sha256 => "sha256",
            SignatureAlgorithm::Sha1 => "sha1",
            SignatureAlgorithm::Md5 => "md5",
        }
    }
}

fn default_signature_header() -> String {
    "X-Webhook-Signature".to_string()
}

fn default_signature_algorithm() -> SignatureAlgorithm {
    SignatureAlgorithm::Sha256
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfig {
    #[serde(default)]
    pub enable_signature_validation: bool,
    #[serde(default)]
    pub signature_secret: Option<String>,
    #[serde(default = "default_signature_header")]
    pub signature_header: String,
    #[serde(default = "default_signature_algorithm")]
    pub signature_algorithm: SignatureAlgorithm,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_signature_validation: false,
            signature_secret: None,
            signature_header: default_signature_header(),
            signature_algorithm: default_signature_algorithm(),
        }
    }
}

impl SecurityConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.enable_signature_validation {
            match self.signature_secret.as_deref() {
                Some(secret) if secret.len() >= 16 => {}
                Some(_) => return Err("signatureSecret must be at least 16 characters".into()),
                None => {
                    return Err(
                        "signatureSecret is required when signature validation is enabled".into(),
                    );
                }
            }
            if self.signature_header.is_empty() {
                return Err("signatureHeader must be non-empty".into());
            }
        }
        Ok(())
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    5
}
fn default_use_backoff() -> bool {
    true
}
fn default_max_delay() -> u64 {
    60
}
fn default_jitter() -> f64 {
    0.2
}
fn default_non_retryable() -> Vec<u16> {
    vec![400, 401, 403, 404, 422]
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_seconds: u64,
    #[serde(default = "default_use_backoff")]
    pub use_exponential_backoff: bool,
    #[serde(default = "default_max_delay")]
    pub max_delay_seconds: u64,
    #[serde(default = "default_jitter")]
    pub jitter_factor: f64,
    #[serde(default = "default_non_retryable")]
    pub non_retryable_status_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_seconds: default_initial_delay(),
            use_exponential_backoff: default_use_backoff(),
            max_delay_seconds: default_max_delay(),
            jitter_factor: default_jitter(),
            non_retryable_status_codes: default_non_retryable(),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=20).contains(&self.max_attempts) {
            return Err("maxAttempts must be between 1 and 20".into());
        }
        if !(1..=300).contains(&self.initial_delay_seconds) {
            return Err("initialDelaySeconds must be between 1 and 300".into());
        }
        if !(1..=3600).contains(&self.max_delay_seconds) {
            return Err("maxDelaySeconds must be between 1 and 3600".into());
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err("jitterFactor must be between 0 and 1".into());
        }
        Ok(())
    }

    pub fn is_non_retryable(&self, status: u16) -> bool {
        self.non_retryable_status_codes.contains(&status)
    }

    /// Delay before the retry that follows attempt `attempt` (1-indexed).
    /// Exponential: `max(initial, min(initial * 2^(k-1), max) + jitter)`
    /// with `jitter = base * jitterFactor * rand[-1, +1]`.
    pub fn backoff_delay(&self, attempt: u32, jitter_unit: f64) -> Duration {
        let initial = self.initial_delay_seconds as f64;
        if !self.use_exponential_backoff {
            return Duration::from_secs_f64(initial);
        }
        let base = (initial * 2f64.powi(attempt.saturating_sub(1) as i32))
            .min(self.max_delay_seconds as f64);
        let jitter = base * self.jitter_factor * jitter_unit.clamp(-1.0, 1.0);
        Duration::from_secs_f64((base + jitter).max(initial))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FilterConfig {
    /// Allow-list: when non-empty, only these instances match.
    #[serde(default)]
    pub instances: Vec<String>,
    /// Deny-list: these instances never match.
    #[serde(default)]
    pub exclude_instances: Vec<String>,
}

impl FilterConfig {
    pub fn matches(&self, instance: Option<&str>) -> bool {
        match instance {
            Some(name) => {
                if self.exclude_instances.iter().any(|i| i == name) {
                    return false;
                }
                self.instances.is_empty() || self.instances.iter().any(|i| i == name)
            }
            // Events without an instance pass through the allow-list only
            // when no allow-list is configured.
            None => self.instances.is_empty(),
        }
    }
}

pub const MIN_TIMEOUT_MS: i32 = 1_000;
pub const MAX_TIMEOUT_MS: i32 = 60_000;
pub const DEFAULT_TIMEOUT_MS: i32 = 30_000;

// ── Models ──────────────────────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
pub struct WebhookRow {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub enabled: bool,
    pub description: Option<String>,
    pub events: Json<Vec<String>>,
    pub headers: Json<std::collections::BTreeMap<String, String>>,
    pub authentication: Json<AuthenticationConfig>,
    pub retry_config: Json<RetryConfig>,
    pub security_config: Json<SecurityConfig>,
    pub filter_config: Json<FilterConfig>,
    pub timeout_ms: i32,
    pub last_execution_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_execution_status: Option<String>,
    pub last_execution_error: Option<String>,
    pub total_executions: i64,
    pub successful_executions: i64,
    pub failed_executions: i64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// In-memory subscriber used by the dispatcher and returned by the API.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub events: Vec<String>,
    pub headers: std::collections::BTreeMap<String, String>,
    pub authentication: AuthenticationConfig,
    pub retry_config: RetryConfig,
    pub security_config: SecurityConfig,
    pub filter_config: FilterConfig,
    pub timeout_ms: i32,
}

impl From<&WebhookRow> for Webhook {
    fn from(row: &WebhookRow) -> Self {
        Self {
            id: row.id,
            name: row.name.clone(),
            url: row.url.clone(),
            enabled: row.enabled,
            description: row.description.clone(),
            events: row.events.0.clone(),
            headers: row.headers.0.clone(),
            authentication: row.authentication.0.clone(),
            retry_config: row.retry_config.0.clone(),
            security_config: row.security_config.0.clone(),
            filter_config: row.filter_config.0.clone(),
            timeout_ms: row.timeout_ms,
        }
    }
}

impl WebhookRow {
    /// Full API view including execution stats.
    pub fn to_api(&self) -> Value {
        let mut value = serde_json::to_value(Webhook::from(self)).unwrap_or_default();
        if let Some(map) = value.as_object_mut() {
            map.insert("stats".into(), self.stats_json());
            map.insert(
                "createdAt".into(),
                Value::String(self.created_at.to_rfc3339()),
            );
            map.insert(
                "updatedAt".into(),
                Value::String(self.updated_at.to_rfc3339()),
            );
        }
        value
    }

    pub fn stats_json(&self) -> Value {
        serde_json::json!({
            "totalExecutions": self.total_executions,
            "successfulExecutions": self.successful_executions,
            "failedExecutions": self.failed_executions,
            "lastExecutionAt": self.last_execution_at.map(|t| t.to_rfc3339()),
            "lastExecutionStatus": self.last_execution_status,
            "lastExecutionError": self.last_execution_error,
        })
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateWebhookRequest {
    pub name: String,
    pub url: String,
    pub enabled: Option<bool>,
    pub description: Option<String>,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub headers: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub authentication: AuthenticationConfig,
    #[serde(default)]
    pub retry_config: RetryConfig,
    #[serde(default)]
    pub security_config: SecurityConfig,
    #[serde(default)]
    pub filter_config: FilterConfig,
    pub timeout_ms: Option<i32>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateWebhookRequest {
    pub name: Option<String>,
    pub url: Option<String>,
    pub enabled: Option<bool>,
    pub description: Option<String>,
    pub events: Option<Vec<String>>,
    pub headers: Option<std::collections::BTreeMap<String, String>>,
    pub authentication: Option<AuthenticationConfig>,
    pub retry_config: Option<RetryConfig>,
    pub security_config: Option<SecurityConfig>,
    pub filter_config: Option<FilterConfig>,
    pub timeout_ms: Option<i32>,
}

// ── Validation ──────────────────────────────────────────────────────────

/// Validate a subscriber URL. HTTP(S) only; outside development mode,
/// loopback and RFC1918 targets are rejected so a subscriber cannot be
/// pointed at internal infrastructure.
pub fn validate_url(raw: &str, dev_mode: bool) -> Result<(), String> {
    let url = url::Url::parse(raw).map_err(|e| format!("invalid url: {}", e))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err("url scheme must be http or https".into());
    }
    let Some(host) = url.host_str() else {
        return Err("url must have a host".into());
    };
    if dev_mode {
        return Ok(());
    }
    if host.eq_ignore_ascii_case("localhost") {
        return Err("url must not point at loopback".into());
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        if ip.is_loopback() || is_rfc1918(&ip) {
            return Err("url must not point at a private address".into());
        }
    }
    Ok(())
}

fn is_rfc1918(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(_) => false,
    }
}

pub fn validate_events(events: &[String]) -> Result<(), String> {
    for e in events {
        if EventKind::parse(e).is_none() {
            return Err(format!("unknown event kind: {}", e));
        }
    }
    Ok(())
}

pub fn validate_timeout(timeout_ms: i32) -> Result<(), String> {
    if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&timeout_ms) {
        return Err(format!(
            "timeout must be between {} and {} ms",
            MIN_TIMEOUT_MS, MAX_TIMEOUT_MS
        ));
    }
    Ok(())
}

// ── Repository ──────────────────────────────────────────────────────────

const WEBHOOK_COLUMNS: &str = "id, name, url, enabled, description, events, headers, \
     authentication, retry_config, security_config, filter_config, timeout_ms, \
     last_execution_at, last_execution_status, last_execution_error, \
     total_executions, successful_executions, failed_executions, created_at, updated_at";

pub async fn list_all(db: &PgPool) -> Result<Vec<WebhookRow>, sqlx::Error> {
    sqlx::query_as::<_, WebhookRow>(&format!(
        "SELECT {WEBHOOK_COLUMNS} FROM rp_external_webhooks ORDER BY name"
    ))
    .fetch_all(db)
    .await
}

pub async fn list_enabled(db: &PgPool) -> Result<Vec<WebhookRow>, sqlx::Error> {
    sqlx::query_as::<_, WebhookRow>(&format!(
        "SELECT {WEBHOOK_COLUMNS} FROM rp_external_webhooks WHERE enabled = TRUE ORDER BY name"
    ))
    .fetch_all(db)
    .await
}

pub async fn get_by_id(db: &PgPool, id: Uuid) -> Result<Option<WebhookRow>, sqlx::Error> {
    sqlx::query_as::<_, WebhookRow>(&format!(
        "SELECT {WEBHOOK_COLUMNS} FROM rp_external_webhooks WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(db)
    .await
}

pub async fn insert(db: &PgPool, req: &CreateWebhookRequest) -> Result<WebhookRow, sqlx::Error> {
    sqlx::query_as::<_, WebhookRow>(&format!(
        "INSERT INTO rp_external_webhooks \
         (name, url, enabled, description, events, headers, authentication, \
          retry_config, security_config, filter_config, timeout_ms) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
         RETURNING {WEBHOOK_COLUMNS}"
    ))
    .bind(&req.name)
    .bind(&req.url)
    .bind(req.enabled.unwrap_or(true))
    .bind(&req.description)
    .bind(Json(&req.events))
    .bind(Json(&req.headers))
    .bind(Json(&req.authentication))
    .bind(Json(&req.retry_config))
    .bind(Json(&req.security_config))
    .bind(Json(&req.filter_config))
    .bind(req.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS))
    .fetch_one(db)
    .await
}

/// Full-row update; the handler merges the patch into the loaded row
/// before calling this.
pub async fn update(db: &PgPool, row: &WebhookRow) -> Result<Option<WebhookRow>, sqlx::Error> {
    sqlx::query_as::<_, WebhookRow>(&format!(
        "UPDATE rp_external_webhooks \
         SET name = $1, url = $2, enabled = $3, description = $4, events = $5, \
             headers = $6, authentication = $7, retry_config = $8, \
             security_config = $9, filter_config = $10, timeout_ms = $11, \
             updated_at = NOW() \
         WHERE id = $12 RETURNING {WEBHOOK_COLUMNS}"
    ))
    .bind(&row.name)
    .bind(&row.url)
    .bind(row.enabled)
    .bind(&row.description)
    .bind(&row.events)
    .bind(&row.headers)
    .bind(&row.authentication)
    .bind(&row.retry_config)
    .bind(&row.security_config)
    .bind(&row.filter_config)
    .bind(row.timeout_ms)
    .bind(row.id)
    .fetch_optional(db)
    .await
}

pub async fn toggle(db: &PgPool, id: Uuid) -> Result<Option<WebhookRow>, sqlx::Error> {
    sqlx::query_as::<_, WebhookRow>(&format!(
        "UPDATE rp_external_webhooks SET enabled = NOT enabled, updated_at = NOW() \
         WHERE id = $1 RETURNING {WEBHOOK_COLUMNS}"
    ))
    .bind(id)
    .fetch_optional(db)
    .await
}

pub async fn delete(db: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM rp_external_webhooks WHERE id = $1")
        .bind(id)
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}

// ── Stats recorder ──────────────────────────────────────────────────────
// Counters move with atomic SQL increments, never read-modify-write, so
// concurrent deliveries cannot lose counts. Recorder errors are logged
// and absorbed: a stats failure must not fail a delivery.

pub async fn record_success(db: &PgPool, id: Uuid, duration_ms: u64) {
    let result = sqlx::query(
        "UPDATE rp_external_webhooks SET \
         total_executions = total_executions + 1, \
         successful_executions = successful_executions + 1, \
         last_execution_at = NOW(), last_execution_status = 'success', \
         last_execution_error = NULL, updated_at = NOW() \
         WHERE id = $1",
    )
    .bind(id)
    .execute(db)
    .await;

    match result {
        Ok(_) => tracing::debug!("webhook {}: delivered in {}ms", id, duration_ms),
        Err(e) => tracing::warn!("webhook {}: failed to record success: {}", id, e),
    }
}

pub async fn record_failure(db: &PgPool, id: Uuid, error: &str) {
    let result = sqlx::query(
        "UPDATE rp_external_webhooks SET \
         total_executions = total_executions + 1, \
         failed_executions = failed_executions + 1, \
         last_execution_at = NOW(), last_execution_status = 'failed', \
         last_execution_error = $2, updated_at = NOW() \
         WHERE id = $1",
    )
    .bind(id)
    .bind(error)
    .execute(db)
    .await;

    if let Err(e) = result {
        tracing::warn!("webhook {}: failed to record failure: {}", id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_discriminator_round_trips() {
        let json = r#"{"type":"bearer","token":"tok-1"}"#;
        let auth: AuthenticationConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(auth, AuthenticationConfig::Bearer { ref token } if token == "tok-1"));

        let json = r#"{"type":"apiKey","token":"k","header":"X-Api-Key"}"#;
        let auth: AuthenticationConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(auth, AuthenticationConfig::ApiKey { .. }));

        let json = r#"{"type":"none"}"#;
        let auth: AuthenticationConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(auth, AuthenticationConfig::None));
    }

    #[test]
    fn authentication_missing_fields_rejected() {
        assert!(serde_json::from_str::<AuthenticationConfig>(r#"{"type":"bearer"}"#).is_err());
        assert!(
            serde_json::from_str::<AuthenticationConfig>(r#"{"type":"basic","user":"u"}"#).is_err()
        );
        assert!(serde_json::from_str::<AuthenticationConfig>(r#"{"type":"hmac"}"#).is_err());
    }

    #[test]
    fn retry_config_bounds() {
        let mut cfg = RetryConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.max_attempts = 0;
        assert!(cfg.validate().is_err());
        cfg.max_attempts = 21;
        assert!(cfg.validate().is_err());
        cfg.max_attempts = 20;
        cfg.initial_delay_seconds = 0;
        assert!(cfg.validate().is_err());
        cfg.initial_delay_seconds = 1;
        cfg.jitter_factor = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = RetryConfig {
            max_attempts: 5,
            initial_delay_seconds: 1,
            use_exponential_backoff: true,
            max_delay_seconds: 4,
            jitter_factor: 0.0,
            non_retryable_status_codes: vec![],
        };
        assert_eq!(cfg.backoff_delay(1, 0.0), Duration::from_secs(1));
        assert_eq!(cfg.backoff_delay(2, 0.0), Duration::from_secs(2));
        assert_eq!(cfg.backoff_delay(3, 0.0), Duration::from_secs(4));
        assert_eq!(cfg.backoff_delay(4, 0.0), Duration::from_secs(4));
    }

    #[test]
    fn backoff_jitter_never_drops_below_initial() {
        let cfg = RetryConfig {
            max_attempts: 3,
            initial_delay_seconds: 2,
            use_exponential_backoff: true,
            max_delay_seconds: 60,
            jitter_factor: 1.0,
            non_retryable_status_codes: vec![],
        };
        // Full negative jitter on the first retry: 2 + 2*1.0*(-1) = 0,
        // clamped back up to the initial delay.
        assert_eq!(cfg.backoff_delay(1, -1.0), Duration::from_secs(2));
    }

    #[test]
    fn backoff_disabled_is_constant() {
        let cfg = RetryConfig {
            use_exponential_backoff: false,
            initial_delay_seconds: 7,
            ..RetryConfig::default()
        };
        assert_eq!(cfg.backoff_delay(1, 0.5), Duration::from_secs(7));
        assert_eq!(cfg.backoff_delay(4, -0.5), Duration::from_secs(7));
    }

    #[test]
    fn security_config_secret_length() {
        let mut cfg = SecurityConfig {
            enable_signature_validation: true,
            signature_secret: Some("0123456789abcdef".into()),
            ..SecurityConfig::default()
        };
        assert!(cfg.validate().is_ok());
        cfg.signature_secret = Some("short".into());
        assert!(cfg.validate().is_err());
        cfg.signature_secret = None;
        assert!(cfg.validate().is_err());
        cfg.enable_signature_validation = false;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn url_validation_modes() {
        assert!(validate_url("https://hooks.example.com/in", false).is_ok());
        assert!(validate_url("ftp://example.com", false).is_err());
        assert!(validate_url("not a url", false).is_err());
        assert!(validate_url("http://localhost:3000/hook", false).is_err());
        assert!(validate_url("http://127.0.0.1/hook", false).is_err());
        assert!(validate_url("http://10.1.2.3/hook", false).is_err());
        assert!(validate_url("http://172.16.0.9/hook", false).is_err());
        assert!(validate_url("http://192.168.1.1/hook", false).is_err());
        // Development mode allows local targets
        assert!(validate_url("http://127.0.0.1:9999/hook", true).is_ok());
    }

    #[test]
    fn filter_matching() {
        let all = FilterConfig::default();
        assert!(all.matches(Some("a")));
        assert!(all.matches(None));

        let allow = FilterConfig {
            instances: vec!["a".into()],
            exclude_instances: vec![],
        };
        assert!(allow.matches(Some("a")));
        assert!(!allow.matches(Some("b")));
        assert!(!allow.matches(None));

        let deny = FilterConfig {
            instances: vec![],
            exclude_instances: vec!["a".into()],
        };
        assert!(!deny.matches(Some("a")));
        assert!(deny.matches(Some("b")));
    }

    #[test]
    fn event_list_validation() {
        assert!(validate_events(&["SEND_MESSAGE".into(), "CALL".into()]).is_ok());
        assert!(validate_events(&["NOT_AN_EVENT".into()]).is_err());
        assert!(validate_events(&[]).is_ok());
    }
}
