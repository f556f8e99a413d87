// Optional api-key authentication middleware.
// If AUTH_API_KEY env is set, all protected routes require
// `apikey: <key>`. If not set, auth is disabled (dev mode).

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};

use crate::state::AppState;

/// Middleware that enforces the `apikey` header when AUTH_API_KEY is
/// configured. Public routes (health, readiness, metrics) should NOT use
/// this middleware.
pub async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let expected = match state.api_key.as_deref() {
        Some(k) => k,
        None => return Ok(next.run(request).await), // Dev mode — no auth required
    };

    let provided = request
        .headers()
        .get("apikey")
        .and_then(|v| v.to_str().ok());

    match provided {
        Some(key) if key == expected => Ok(next.run(request).await),
        Some(_) => {
            tracing::warn!("Auth failed: invalid api key");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            tracing::warn!("Auth failed: missing apikey header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}
