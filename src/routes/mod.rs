// ============================================================================
// HTTP Surface
// ============================================================================
//
// /health and /metrics, the /auth and /admin groups, and the catch-all
// pipeline for everything else. The pipeline itself owns /api/*.
//
// ============================================================================

pub mod admin;
pub mod auth;

use crate::auth::Principal;
use crate::error::{GatewayError, GatewayResult};
use crate::gateway;
use crate::state::AppState;
use crate::utils::add_security_headers;
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{Json, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .nest("/auth", auth::router())
        .nest("/admin", admin::router())
        .fallback(gateway::handle_request)
        .layer(axum::middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Stamp the security header set on every response, pipeline or not.
async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    add_security_headers(response.headers_mut());
    response
}

/// Unauthenticated liveness + per-service health map.
async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime": state.monitor.uptime_secs(),
        "version": gateway::GATEWAY_VERSION,
        "environment": state.config.environment,
        "services": state.services.health_snapshot(),
    }))
}

/// Monitoring snapshot; admin only.
async fn metrics(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> GatewayResult<Json<serde_json::Value>> {
    require_admin(&state, &headers).await?;
    Ok(Json(state.monitor.snapshot()))
}

/// Resolve and require an admin principal, shared by /metrics and /admin.
pub async fn require_admin(state: &AppState, headers: &HeaderMap) -> GatewayResult<Principal> {
    let principal = state.auth.verify_request(headers).await?;
    if !principal.is_admin() {
        return Err(GatewayError::Forbidden(
            "Admin permission required".to_string(),
        ));
    }
    Ok(principal)
}
