pub mod audit;
pub mod auth;
pub mod balancer;
pub mod breaker;
pub mod dispatcher;
pub mod events;
pub mod groups;
pub mod handlers;
pub mod instances;
pub mod registry;
pub mod rotation;
pub mod sender;
pub mod state;
pub mod watchdog;
pub mod webhooks;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{delete, get, patch, post};
use tower_governor::{GovernorLayer, governor::GovernorConfigBuilder};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use state::AppState;

// ═══════════════════════════════════════════════════════════════════════
//  Request correlation ID middleware
// ═══════════════════════════════════════════════════════════════════════

/// Middleware that generates a UUID v4 correlation ID for each request.
///
/// - Adds it to the current tracing span as `request_id`
/// - Returns it in the `X-Request-Id` response header
/// - Accepts an incoming `X-Request-Id` header to propagate from upstream
async fn request_id_middleware(
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    tracing::Span::current().record("request_id", request_id.as_str());
    tracing::debug!(request_id = %request_id, "request correlation ID assigned");

    let mut response = next.run(req).await;

    if let Ok(header_value) = axum::http::HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", header_value);
    }

    response
}

// ── OpenAPI documentation ────────────────────────────────────────────────────

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Relaypool API",
        version = "1.2.0",
        description = "Instance-group load balancing and external webhook gateway",
        license(name = "MIT")
    ),
    paths(
        // Health
        handlers::health_check,
        handlers::readiness,
        // Groups
        handlers::create_group,
        handlers::list_groups,
        handlers::get_group,
        handlers::get_group_by_name,
        handlers::get_group_by_alias,
        handlers::update_group,
        handlers::delete_group,
        handlers::add_group_instance,
        handlers::remove_group_instance,
        handlers::active_instances,
        handlers::group_stats,
        // Messages
        handlers::send_text_with_group_balancing,
        // Webhooks
        handlers::create_webhook,
        handlers::list_webhooks,
        handlers::get_webhook,
        handlers::update_webhook,
        handlers::toggle_webhook,
        handlers::delete_webhook,
        handlers::webhook_stats,
        handlers::test_webhook,
        // Instances
        handlers::create_instance,
        handlers::list_instances,
        handlers::delete_instance,
        handlers::update_connection,
    ),
    components(schemas(
        groups::InstanceGroup,
        groups::CreateGroupRequest,
        groups::UpdateGroupRequest,
        groups::MemberRequest,
        webhooks::CreateWebhookRequest,
        webhooks::UpdateWebhookRequest,
        webhooks::AuthenticationConfig,
        webhooks::RetryConfig,
        webhooks::SecurityConfig,
        webhooks::FilterConfig,
        instances::Instance,
        instances::CreateInstanceRequest,
        instances::ConnectionUpdateRequest,
        handlers::BalancedSendRequest,
        handlers::TestWebhookRequest,
        balancer::BalancingInfo,
        dispatcher::DeliveryOutcome,
        sender::SendTextRequest,
    )),
    tags(
        (name = "health", description = "Health & readiness endpoints"),
        (name = "groups", description = "Instance-group management"),
        (name = "messages", description = "Balanced message sending"),
        (name = "webhooks", description = "External webhook subscribers"),
        (name = "instances", description = "Instance registry"),
    )
)]
pub struct ApiDoc;

/// Build the application router with the given shared state.
/// Extracted from `main()` so integration tests can construct the app
/// without binding to a network port.
pub fn create_router(state: AppState) -> Router {
    // ── Per-endpoint rate limiting ───────────────────────────────────
    // Balanced sends: 60 req/min (1 per second, burst 60)
    let rl_send = GovernorConfigBuilder::default()
        .per_second(1)
        .burst_size(60)
        .finish()
        .expect("rate limiter config: send");
    // Other protected routes: 120 req/min (1 per 0.5s burst 120)
    let rl_default = GovernorConfigBuilder::default()
        .per_millisecond(500)
        .burst_size(120)
        .finish()
        .expect("rate limiter config: default");

    // ── Public routes (no auth) ──────────────────────────────────────
    let public = Router::new()
        .route("/api/health", get(handlers::health_check))
        .route("/api/health/ready", get(handlers::readiness))
        .route("/api/metrics", get(handlers::metrics_handler));

    // ── Protected: balanced send — own limiter ───────────────────────
    let send_routes = Router::new()
        .route(
            "/message/sendTextWithGroupBalancing",
            post(handlers::send_text_with_group_balancing),
        )
        .layer(GovernorLayer::new(rl_send));

    // ── Protected: admin routes ──────────────────────────────────────
    let admin_routes = Router::new()
        .route(
            "/instance-group",
            get(handlers::list_groups).post(handlers::create_group),
        )
        .route(
            "/instance-group/{id}",
            get(handlers::get_group)
                .put(handlers::update_group)
                .delete(handlers::delete_group),
        )
        .route("/instance-group/name/{name}", get(handlers::get_group_by_name))
        .route(
            "/instance-group/alias/{alias}",
            get(handlers::get_group_by_alias),
        )
        .route(
            "/instance-group/{id}/addInstance",
            post(handlers::add_group_instance),
        )
        .route(
            "/instance-group/{id}/removeInstance",
            post(handlers::remove_group_instance),
        )
        .route(
            "/instance-group/{id}/activeInstances",
            get(handlers::active_instances),
        )
        .route("/instance-group/{id}/stats", get(handlers::group_stats))
        .route(
            "/external-webhook",
            get(handlers::list_webhooks).post(handlers::create_webhook),
        )
        .route(
            "/external-webhook/{id}",
            get(handlers::get_webhook)
                .put(handlers::update_webhook)
                .delete(handlers::delete_webhook),
        )
        .route(
            "/external-webhook/{id}/toggle",
            patch(handlers::toggle_webhook),
        )
        .route("/external-webhook/{id}/stats", get(handlers::webhook_stats))
        .route("/external-webhook/{id}/test", post(handlers::test_webhook))
        .route(
            "/instance",
            get(handlers::list_instances).post(handlers::create_instance),
        )
        .route("/instance/{name}", delete(handlers::delete_instance))
        .route(
            "/instance/{name}/connection",
            patch(handlers::update_connection),
        )
        .layer(GovernorLayer::new(rl_default));

    // ── Merge all protected routes with auth layer ──────────────────
    let protected = send_routes.merge(admin_routes).route_layer(
        middleware::from_fn_with_state(state.clone(), auth::require_auth),
    );

    public
        .merge(protected)
        // Swagger UI — no auth required
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // 2 MB body limit — must be before .with_state() for Json extractor
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024))
        // Request correlation ID — adds X-Request-Id header to every response
        .layer(axum::middleware::from_fn(request_id_middleware))
        .with_state(state)
}
