//! Handler modules for the Relaypool API.
//!
//! - `health` — health, readiness, metrics
//! - `groups` — instance-group CRUD + membership operations
//! - `instances` — instance registry admin + connection ingestion
//! - `messages` — balanced send endpoint
//! - `webhooks` — external webhook subscriber CRUD, test delivery

pub mod groups;
pub mod health;
pub mod instances;
pub mod messages;
pub mod webhooks;

pub use groups::*;
pub use health::*;
pub use instances::*;
pub use messages::*;
pub use webhooks::*;

use axum::Json;
use axum::http::StatusCode;
use serde_json::json;

// ═══════════════════════════════════════════════════════════════════════
//  Centralized API error type
// ═══════════════════════════════════════════════════════════════════════

/// Logs full details server-side, returns structured JSON to the client.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Structured error code string for programmatic consumption.
    fn error_code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Upstream(_) => "UPSTREAM_ERROR",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            // Upstream send failures surface as 500 with the backend's
            // message so callers can diagnose the worker.
            ApiError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        tracing::error!("API error ({}): {}", status.as_u16(), self);

        // Internal details never leak; everything else is actionable for
        // the caller and safe to return.
        let message = match &self {
            ApiError::BadRequest(m) | ApiError::NotFound(m) | ApiError::Upstream(m) => m.clone(),
            ApiError::Internal(_) => "Internal server error".to_string(),
        };

        (
            status,
            Json(json!({ "error": message, "error_code": self.error_code() })),
        )
            .into_response()
    }
}

// ── Shared helpers ────────────────────────────────────────────────────────

/// Wrap an unexpected storage error.
pub(crate) fn internal(context: &str, e: impl std::fmt::Display) -> ApiError {
    ApiError::Internal(format!("{}: {}", context, e))
}

/// Translate a unique-constraint violation into a 400 with a friendly
/// message; anything else is a 500.
pub(crate) fn db_create_error(e: sqlx::Error, what: &str) -> ApiError {
    if let Some(db_err) = e.as_database_error() {
        if db_err.is_unique_violation() {
            let field = match db_err.constraint() {
                Some(c) if c.contains("alias") => "alias",
                _ => "name",
            };
            return ApiError::BadRequest(format!("{} {} already in use", what, field));
        }
    }
    internal(&format!("failed to store {}", what), e)
}

pub(crate) fn parse_uuid(id: &str) -> Result<uuid::Uuid, ApiError> {
    id.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid id: {}", id)))
}
