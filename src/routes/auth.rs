// ============================================================================
// Auth Routes
// ============================================================================
//
// Login issues a bearer token; logout and refresh blacklist the presented
// token's jti for its remaining life; profile echoes the resolved
// principal; api-keys (admin) mints API key records. Key material is
// returned exactly once, at creation.
//
// ============================================================================

use crate::auth::{Claims, Permission};
use crate::error::{GatewayError, GatewayResult};
use crate::state::AppState;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/refresh", post(refresh))
        .route("/profile", get(profile))
        .route("/api-keys", post(create_api_key))
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LoginRequest>,
) -> GatewayResult<Json<serde_json::Value>> {
    let user = state
        .auth
        .authenticate(&request.username, &request.password)
        .await?;
    let (token, _jti, expires_at) = state
        .auth
        .create_token(&user.id)
        .map_err(|e| GatewayError::Internal(e.to_string()))?;

    tracing::info!(username = %user.username, "User logged in");
    Ok(Json(json!({
        "token": token,
        "expiresAt": expires_at,
        "user": {
            "id": user.id,
            "username": user.username,
            "permissions": user.permissions.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
        },
    })))
}

/// The bearer token on this request, verified.
async fn bearer_claims(state: &AppState, headers: &HeaderMap) -> GatewayResult<Claims> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| GatewayError::Unauthenticated("Bearer token required".to_string()))?;
    state.auth.verify_token(token).await
}

async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> GatewayResult<Json<serde_json::Value>> {
    let claims = bearer_claims(&state, &headers).await?;
    state.auth.blacklist(&claims.jti, claims.exp).await;
    tracing::debug!(jti = %claims.jti, "Token blacklisted on logout");
    Ok(Json(json!({ "message": "Logged out" })))
}

/// Blacklist the old token and issue a new one. JWT only.
async fn refresh(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> GatewayResult<Json<serde_json::Value>> {
    let claims = bearer_claims(&state, &headers).await?;
    state.auth.blacklist(&claims.jti, claims.exp).await;
    let (token, _jti, expires_at) = state
        .auth
        .create_token(&claims.sub)
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
    Ok(Json(json!({ "token": token, "expiresAt": expires_at })))
}

async fn profile(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> GatewayResult<Json<serde_json::Value>> {
    let principal = state.auth.verify_request(&headers).await?;
    Ok(Json(json!({
        "id": principal.id,
        "method": principal.method,
        "permissions": principal
            .permissions
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>(),
        "apiKey": principal.api_key.as_ref().map(|k| json!({
            "name": k.name,
            "quotaMaxRequests": k.quota_max_requests,
            "quotaWindowMs": k.quota_window_ms,
        })),
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateApiKeyRequest {
    name: String,
    #[serde(default)]
    permissions: Vec<String>,
    quota_max_requests: Option<u32>,
    quota_window_ms: Option<u64>,
}

async fn create_api_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CreateApiKeyRequest>,
) -> GatewayResult<(StatusCode, Json<serde_json::Value>)> {
    super::require_admin(&state, &headers).await?;

    let mut permissions = HashSet::new();
    for raw in &request.permissions {
        let permission: Permission = raw
            .parse()
            .map_err(|e: anyhow::Error| GatewayError::Validation(e.to_string()))?;
        permissions.insert(permission);
    }

    let record = state
        .auth
        .create_api_key(
            &request.name,
            permissions,
            request.quota_max_requests,
            request.quota_window_ms,
        )
        .await;

    tracing::info!(name = %record.name, "API key created");
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "key": record.key,
            "name": record.name,
            "permissions": record.permissions.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
            "quotaMaxRequests": record.quota_max_requests,
            "quotaWindowMs": record.quota_window_ms,
            "createdAt": record.created_at.to_rfc3339(),
        })),
    ))
}
