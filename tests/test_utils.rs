// Shared helpers for the gateway integration tests: a configurable
// throwaway upstream and a gateway instance bound to an ephemeral port.

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::response::IntoResponse;
use axum::Router;
use portico::auth::Permission;
use portico::config::{
    GatewayConfig, InstanceConfig, LoadBalancingPolicy, ServiceConfig,
};
use portico::routes::build_router;
use portico::state::AppState;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;

pub const TEST_JWT_SECRET: &str = "integration-test-secret-0123456789abcdef";

/// Handle to a spawned upstream: observed hit count and a switchable
/// response status.
#[derive(Clone)]
pub struct Upstream {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicU32>,
    pub status: Arc<AtomicU16>,
}

impl Upstream {
    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    pub fn instance(&self) -> InstanceConfig {
        InstanceConfig {
            host: "127.0.0.1".to_string(),
            port: self.addr.port(),
            weight: 1,
        }
    }

    pub fn set_status(&self, status: u16) {
        self.status.store(status, Ordering::Relaxed);
    }

    pub fn hit_count(&self) -> u32 {
        self.hits.load(Ordering::Relaxed)
    }
}

struct UpstreamState {
    hits: Arc<AtomicU32>,
    status: Arc<AtomicU16>,
    port: u16,
}

async fn upstream_handler(
    State(state): State<Arc<UpstreamState>>,
    request: Request,
) -> axum::response::Response {
    let path = request.uri().path().to_string();
    if path == "/health" {
        return axum::Json(serde_json::json!({"status": "ok"})).into_response();
    }
    let hits = state.hits.fetch_add(1, Ordering::Relaxed) + 1;
    let status = state.status.load(Ordering::Relaxed);
    if status >= 400 {
        return (
            axum::http::StatusCode::from_u16(status).unwrap(),
            axum::Json(serde_json::json!({"error": "upstream failure"})),
        )
            .into_response();
    }
    let body = axum::body::to_bytes(request.into_body(), 1024 * 1024)
        .await
        .unwrap_or_else(|_| Bytes::new());
    let echo: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    axum::Json(serde_json::json!({
        "path": path,
        "hits": hits,
        "instance": format!("127.0.0.1:{}", state.port),
        "echo": echo,
    }))
    .into_response()
}

/// Spawn an upstream that answers every path and reports its hit count.
pub async fn spawn_upstream() -> Upstream {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicU32::new(0));
    let status = Arc::new(AtomicU16::new(200));
    let state = Arc::new(UpstreamState {
        hits: hits.clone(),
        status: status.clone(),
        port: addr.port(),
    });
    let app = Router::new()
        .fallback(upstream_handler)
        .with_state(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Upstream { addr, hits, status }
}

/// Base config: auth via basic credentials, JWT secret set, no Redis.
pub fn base_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.auth.jwt_secret = TEST_JWT_SECRET.to_string();
    config.cache.redis_url = None;
    config
}

pub fn service(name: &str, prefix: &str, instances: Vec<InstanceConfig>) -> ServiceConfig {
    ServiceConfig {
        name: name.to_string(),
        path_prefix: prefix.to_string(),
        strip_prefix: false,
        instances,
        policy: LoadBalancingPolicy::RoundRobin,
        timeout_ms: 5_000,
        ..ServiceConfig::default()
    }
}

/// Spawned gateway plus credentials for a regular and an admin user.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

pub async fn spawn_gateway(config: GatewayConfig) -> TestGateway {
    let state = AppState::build(config).await.expect("state build failed");
    state
        .auth
        .store()
        .add_user("alice", "Password123", HashSet::from([Permission::Write]))
        .await
        .unwrap();
    state
        .auth
        .store()
        .add_user("root", "RootPassword1", HashSet::from([Permission::Admin]))
        .await
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    TestGateway { addr, state }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::new()
}

/// Basic credentials for the seeded regular user.
pub fn user_auth(request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    request.basic_auth("alice", Some("Password123"))
}

/// Basic credentials for the seeded admin user.
pub fn admin_auth(request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    request.basic_auth("root", Some("RootPassword1"))
}
