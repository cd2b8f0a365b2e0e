// ============================================================================
// Admin Routes
// ============================================================================
//
// Administration surface: service and route listings, cache invalidation
// and flush, circuit breaker inspection and reset, plugin management.
// Every handler requires an admin principal.
//
// ============================================================================

use crate::error::{GatewayError, GatewayResult};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/services", get(list_services))
        .route("/routes", get(list_routes))
        .route("/cache/invalidate", post(invalidate_cache))
        .route("/cache/flush", post(flush_cache))
        .route("/circuits", get(list_circuits))
        .route("/circuits/:service/reset", post(reset_circuit))
        .route("/plugins", get(list_plugins))
        .route("/plugins/:name/load", post(load_plugin))
        .route("/plugins/:name/unload", post(unload_plugin))
        .route("/plugins/:name/reload", post(reload_plugin))
}

async fn list_services(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> GatewayResult<Json<serde_json::Value>> {
    super::require_admin(&state, &headers).await?;
    let services: Vec<serde_json::Value> = state
        .services
        .services()
        .iter()
        .map(|service| {
            json!({
                "name": service.config.name,
                "pathPrefix": service.config.path_prefix,
                "policy": service.config.policy,
                "timeoutMs": service.config.timeout_ms,
                "instances": service
                    .instances
                    .iter()
                    .map(|i| json!({
                        "address": i.address(),
                        "weight": i.config.weight,
                        "healthy": i.is_healthy(),
                        "activeConnections": i.active_connections(),
                    }))
                    .collect::<Vec<_>>(),
            })
        })
        .collect();
    Ok(Json(json!({ "services": services })))
}

async fn list_routes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> GatewayResult<Json<serde_json::Value>> {
    super::require_admin(&state, &headers).await?;
    let routes: Vec<serde_json::Value> = state
        .services
        .services()
        .iter()
        .map(|service| {
            json!({
                "prefix": service.config.path_prefix,
                "service": service.config.name,
                "stripPrefix": service.config.strip_prefix,
            })
        })
        .collect();
    Ok(Json(json!({ "routes": routes })))
}

#[derive(Deserialize)]
struct InvalidateRequest {
    pattern: String,
}

async fn invalidate_cache(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<InvalidateRequest>,
) -> GatewayResult<Json<serde_json::Value>> {
    super::require_admin(&state, &headers).await?;
    let removed = state.cache.invalidate_pattern(&request.pattern).await;
    tracing::info!(pattern = %request.pattern, removed = removed, "Cache invalidated by admin");
    Ok(Json(json!({ "removed": removed })))
}

async fn flush_cache(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> GatewayResult<Json<serde_json::Value>> {
    super::require_admin(&state, &headers).await?;
    let removed = state.cache.flush().await;
    tracing::info!(removed = removed, "Cache flushed by admin");
    Ok(Json(json!({ "removed": removed })))
}

async fn list_circuits(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> GatewayResult<Json<serde_json::Value>> {
    super::require_admin(&state, &headers).await?;
    Ok(Json(json!({ "circuits": state.breakers.stats() })))
}

async fn reset_circuit(
    State(state): State<Arc<AppState>>,
    Path(service): Path<String>,
    headers: HeaderMap,
) -> GatewayResult<Json<serde_json::Value>> {
    super::require_admin(&state, &headers).await?;
    if !state.breakers.reset(&service) {
        return Err(GatewayError::NotFound(format!(
            "No circuit for service '{}'",
            service
        )));
    }
    Ok(Json(json!({ "service": service, "state": "closed" })))
}

async fn list_plugins(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> GatewayResult<Json<serde_json::Value>> {
    super::require_admin(&state, &headers).await?;
    Ok(Json(json!({ "plugins": state.plugins.list().await })))
}

async fn load_plugin(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> GatewayResult<Json<serde_json::Value>> {
    super::require_admin(&state, &headers).await?;
    state
        .plugins
        .load(&name)
        .await
        .map_err(|e| GatewayError::Validation(e.to_string()))?;
    Ok(Json(json!({ "plugin": name, "loaded": true })))
}

async fn unload_plugin(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> GatewayResult<Json<serde_json::Value>> {
    super::require_admin(&state, &headers).await?;
    state
        .plugins
        .unload(&name)
        .await
        .map_err(|e| GatewayError::Validation(e.to_string()))?;
    Ok(Json(json!({ "plugin": name, "loaded": false })))
}

async fn reload_plugin(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> GatewayResult<Json<serde_json::Value>> {
    super::require_admin(&state, &headers).await?;
    state
        .plugins
        .reload(&name)
        .await
        .map_err(|e| GatewayError::Validation(e.to_string()))?;
    Ok(Json(json!({ "plugin": name, "reloaded": true })))
}
