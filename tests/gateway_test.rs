// ============================================================================
// Gateway Integration Tests
// ============================================================================
//
// Each test spawns its own gateway and throwaway upstreams on ephemeral
// ports and drives them over HTTP.
//
// ============================================================================

use portico::config::{CircuitBreakerConfig, InvalidationRuleConfig, PathTtlConfig};

mod test_utils;
use test_utils::*;

#[tokio::test]
async fn test_pipeline_requires_authentication() {
    let upstream = spawn_upstream().await;
    let mut config = base_config();
    config
        .routing
        .services
        .push(service("users", "/api/users", vec![upstream.instance()]));
    let gateway = spawn_gateway(config).await;

    let response = client()
        .get(gateway.url("/api/users/42"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "UNAUTHENTICATED");
    assert_eq!(upstream.hit_count(), 0);
}

#[tokio::test]
async fn test_gateway_headers_injected() {
    let upstream = spawn_upstream().await;
    let mut config = base_config();
    config
        .routing
        .services
        .push(service("users", "/api/users", vec![upstream.instance()]));
    let gateway = spawn_gateway(config).await;

    let response = user_auth(client().get(gateway.url("/api/users/1")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let headers = response.headers();
    assert!(headers.contains_key("x-request-id"));
    assert!(headers.contains_key("x-gateway-version"));
    assert!(headers.contains_key("x-response-time"));
    assert_eq!(headers.get("x-gateway-service").unwrap(), "users");
    assert_eq!(
        headers.get("x-gateway-instance").unwrap(),
        upstream.address().as_str()
    );
    // Security header set
    assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
    assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
}

#[tokio::test]
async fn test_cache_miss_then_hit_with_identical_body() {
    // S1: the second identical call within TTL is a HIT and byte-identical
    let upstream = spawn_upstream().await;
    let mut config = base_config();
    config
        .routing
        .services
        .push(service("users", "/api/users", vec![upstream.instance()]));
    config.cache.path_ttls.push(PathTtlConfig {
        path_prefix: "/api/users".to_string(),
        ttl_secs: 600,
    });
    let gateway = spawn_gateway(config).await;

    let first = user_auth(client().get(gateway.url("/api/users/42")))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);
    assert_eq!(first.headers().get("x-cache").unwrap(), "MISS");
    let first_body = first.bytes().await.unwrap();
    assert_eq!(upstream.hit_count(), 1);

    let second = user_auth(client().get(gateway.url("/api/users/42")))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 200);
    assert_eq!(second.headers().get("x-cache").unwrap(), "HIT");
    let second_body = second.bytes().await.unwrap();

    // No further upstream traffic, byte-identical body
    assert_eq!(upstream.hit_count(), 1);
    assert_eq!(first_body, second_body);
}

#[tokio::test]
async fn test_mutation_invalidates_cache() {
    // S2: a successful POST under the rule prefix evicts the entry
    let upstream = spawn_upstream().await;
    let mut config = base_config();
    config
        .routing
        .services
        .push(service("users", "/api/users", vec![upstream.instance()]));
    config.cache.invalidation_rules.push(InvalidationRuleConfig {
        path_prefix: "/api/users".to_string(),
        methods: vec!["POST".to_string()],
    });
    let gateway = spawn_gateway(config).await;

    let first = user_auth(client().get(gateway.url("/api/users/42")))
        .send()
        .await
        .unwrap();
    assert_eq!(first.headers().get("x-cache").unwrap(), "MISS");
    let second = user_auth(client().get(gateway.url("/api/users/42")))
        .send()
        .await
        .unwrap();
    assert_eq!(second.headers().get("x-cache").unwrap(), "HIT");

    let post = user_auth(client().post(gateway.url("/api/users")))
        .json(&serde_json::json!({"name": "new"}))
        .send()
        .await
        .unwrap();
    assert_eq!(post.status(), 200);

    // Invalidation is best-effort after the response; give it a beat
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let third = user_auth(client().get(gateway.url("/api/users/42")))
        .send()
        .await
        .unwrap();
    assert_eq!(third.headers().get("x-cache").unwrap(), "MISS");
}

#[tokio::test]
async fn test_global_rate_limit_window() {
    // S4: windowMs=60000, maxRequests=2 -> 200, 200, 429
    let upstream = spawn_upstream().await;
    let mut config = base_config();
    config.rate_limit.window_ms = 60_000;
    config.rate_limit.max_requests = 2;
    config
        .routing
        .services
        .push(service("users", "/api/users", vec![upstream.instance()]));
    let gateway = spawn_gateway(config).await;

    for _ in 0..2 {
        let response = user_auth(client().get(gateway.url("/api/users/1")))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }
    let third = user_auth(client().get(gateway.url("/api/users/1")))
        .send()
        .await
        .unwrap();
    assert_eq!(third.status(), 429);
    assert_eq!(third.headers().get("x-ratelimit-limit").unwrap(), "2");
    assert_eq!(third.headers().get("x-ratelimit-remaining").unwrap(), "0");
    assert!(third.headers().contains_key("retry-after"));
    let body: serde_json::Value = third.json().await.unwrap();
    assert_eq!(body["error"], "RATE_LIMITED");
}

#[tokio::test]
async fn test_round_robin_and_failover() {
    // S5: A, B, A, B; then with A down both requests land on B
    let a = spawn_upstream().await;
    let b = spawn_upstream().await;
    let mut config = base_config();
    config.routing.services.push(service(
        "users",
        "/api/users",
        vec![a.instance(), b.instance()],
    ));
    // Keep the breaker out of the way of the failover part
    config.circuit_breaker = CircuitBreakerConfig {
        error_count: 100,
        ..CircuitBreakerConfig::default()
    };
    let gateway = spawn_gateway(config).await;

    let mut seen = Vec::new();
    for _ in 0..4 {
        let response = user_auth(client().get(gateway.url("/api/users/1")))
            .send()
            .await
            .unwrap();
        seen.push(
            response
                .headers()
                .get("x-gateway-instance")
                .unwrap()
                .to_str()
                .unwrap()
                .to_string(),
        );
    }
    assert_eq!(seen[0], a.address());
    assert_eq!(seen[1], b.address());
    assert_eq!(seen[2], a.address());
    assert_eq!(seen[3], b.address());

    // Three consecutive passive failures mark A unhealthy
    for _ in 0..3 {
        gateway
            .state
            .services
            .find_by_name("users")
            .unwrap()
            .instances
            .iter()
            .find(|i| i.address() == a.address())
            .unwrap()
            .record_failure();
    }

    for _ in 0..2 {
        let response = user_auth(client().get(gateway.url("/api/users/1")))
            .send()
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("x-gateway-instance").unwrap(),
            b.address().as_str()
        );
    }
}

#[tokio::test]
async fn test_unknown_service_is_404() {
    let mut config = base_config();
    config.routing.services.push(service(
        "users",
        "/api/users",
        vec![spawn_upstream().await.instance()],
    ));
    let gateway = spawn_gateway(config).await;

    let response = user_auth(client().get(gateway.url("/api/nowhere/1")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "NOT_FOUND");
}

#[tokio::test]
async fn test_all_instances_down_is_503() {
    // Single instance at a closed port: three 502s, then the instance is
    // unhealthy and the router answers 503 directly
    let dead = {
        // Bind and drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let mut config = base_config();
    config.routing.services.push(service(
        "users",
        "/api/users",
        vec![portico::config::InstanceConfig {
            host: "127.0.0.1".to_string(),
            port: dead.port(),
            weight: 1,
        }],
    ));
    config.circuit_breaker = CircuitBreakerConfig {
        error_count: 100,
        ..CircuitBreakerConfig::default()
    };
    let gateway = spawn_gateway(config).await;

    for _ in 0..3 {
        let response = user_auth(client().get(gateway.url("/api/users/1")))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 502);
    }
    let response = user_auth(client().get(gateway.url("/api/users/1")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "NO_HEALTHY_INSTANCE");
}

#[tokio::test]
async fn test_circuit_breaker_open_and_recovery() {
    // S3: errorCount=3, threshold=50, resetTimeout=1s; three 500s open the
    // circuit, the fourth request is rejected with Retry-After, and after
    // the reset window three successes close it again.
    let upstream = spawn_upstream().await;
    let mut config = base_config();
    config
        .routing
        .services
        .push(service("flaky", "/api/flaky", vec![upstream.instance()]));
    config.circuit_breaker = CircuitBreakerConfig {
        timeout_ms: 5_000,
        error_count: 3,
        error_threshold: 50,
        reset_timeout_ms: 1_000,
        half_open_requests: 3,
    };
    let gateway = spawn_gateway(config).await;

    upstream.set_status(500);
    for _ in 0..3 {
        let response = user_auth(client().get(gateway.url("/api/flaky/x")))
            .send()
            .await
            .unwrap();
        // Upstream errors are proxied while the circuit is closed
        assert_eq!(response.status(), 500);
    }

    let rejected = user_auth(client().get(gateway.url("/api/flaky/x")))
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), 503);
    assert_eq!(rejected.headers().get("retry-after").unwrap(), "1");
    let body: serde_json::Value = rejected.json().await.unwrap();
    assert_eq!(body["error"], "CIRCUIT_OPEN");
    let hits_while_open = upstream.hit_count();

    // After the reset window the next request is admitted as a probe
    tokio::time::sleep(std::time::Duration::from_millis(1_100)).await;
    upstream.set_status(200);
    for _ in 0..3 {
        let response = user_auth(client().get(gateway.url("/api/flaky/x")))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }
    assert!(upstream.hit_count() > hits_while_open);

    // Closed again: traffic flows
    let response = user_auth(client().get(gateway.url("/api/flaky/x")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_request_body_transform_reaches_upstream() {
    // S6: trim then lowercase on user.name; the upstream echoes its body
    let upstream = spawn_upstream().await;
    let mut config = base_config();
    config
        .routing
        .services
        .push(service("echo", "/api/echo", vec![upstream.instance()]));
    config.transformation.rules.push(portico::config::TransformRuleConfig {
        path_prefix: "/api/echo".to_string(),
        request: vec![
            portico::config::TransformOpConfig {
                target: "body".to_string(),
                action: "transform".to_string(),
                path: "user.name".to_string(),
                value: None,
                function: Some("trim".to_string()),
            },
            portico::config::TransformOpConfig {
                target: "body".to_string(),
                action: "transform".to_string(),
                path: "user.name".to_string(),
                value: None,
                function: Some("lowercase".to_string()),
            },
        ],
        response: Vec::new(),
    });
    let gateway = spawn_gateway(config).await;

    let response = user_auth(client().post(gateway.url("/api/echo")))
        .json(&serde_json::json!({"user": {"name": "  ALICE  "}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["echo"]["user"]["name"], "alice");
}

#[tokio::test]
async fn test_threat_detection_blocks_request() {
    let upstream = spawn_upstream().await;
    let mut config = base_config();
    config
        .routing
        .services
        .push(service("users", "/api/users", vec![upstream.instance()]));
    let gateway = spawn_gateway(config).await;

    let response = user_auth(client().get(
        gateway.url("/api/users?q=1%20union%20select%20*%20from%20users"),
    ))
    .send()
    .await
    .unwrap();
    assert_eq!(response.status(), 400);
    assert_eq!(upstream.hit_count(), 0);
}

#[tokio::test]
async fn test_login_logout_token_lifecycle() {
    let gateway = spawn_gateway(base_config()).await;

    // Wrong password
    let bad = client()
        .post(gateway.url("/auth/login"))
        .json(&serde_json::json!({"username": "alice", "password": "nope"}))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), 401);

    let login = client()
        .post(gateway.url("/auth/login"))
        .json(&serde_json::json!({"username": "alice", "password": "Password123"}))
        .send()
        .await
        .unwrap();
    assert_eq!(login.status(), 200);
    let body: serde_json::Value = login.json().await.unwrap();
    let token = body["token"].as_str().unwrap().to_string();
    assert_eq!(body["user"]["username"], "alice");

    // Token works for the profile endpoint
    let profile = client()
        .get(gateway.url("/auth/profile"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(profile.status(), 200);

    // Logout blacklists the token
    let logout = client()
        .post(gateway.url("/auth/logout"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(logout.status(), 200);

    let after = client()
        .get(gateway.url("/auth/profile"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(after.status(), 401);
}

#[tokio::test]
async fn test_refresh_rotates_token() {
    let gateway = spawn_gateway(base_config()).await;
    let login: serde_json::Value = client()
        .post(gateway.url("/auth/login"))
        .json(&serde_json::json!({"username": "alice", "password": "Password123"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let old_token = login["token"].as_str().unwrap().to_string();

    let refresh: serde_json::Value = client()
        .post(gateway.url("/auth/refresh"))
        .bearer_auth(&old_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let new_token = refresh["token"].as_str().unwrap().to_string();
    assert_ne!(old_token, new_token);

    // Old token revoked, new one valid
    let old = client()
        .get(gateway.url("/auth/profile"))
        .bearer_auth(&old_token)
        .send()
        .await
        .unwrap();
    assert_eq!(old.status(), 401);
    let new = client()
        .get(gateway.url("/auth/profile"))
        .bearer_auth(&new_token)
        .send()
        .await
        .unwrap();
    assert_eq!(new.status(), 200);
}

#[tokio::test]
async fn test_api_key_quota_override() {
    let upstream = spawn_upstream().await;
    let mut config = base_config();
    config
        .routing
        .services
        .push(service("users", "/api/users", vec![upstream.instance()]));
    let gateway = spawn_gateway(config).await;

    // Admin mints a key limited to 2 requests per window
    let created: serde_json::Value = admin_auth(client().post(gateway.url("/auth/api-keys")))
        .json(&serde_json::json!({
            "name": "ci",
            "permissions": ["read"],
            "quotaMaxRequests": 2,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let key = created["key"].as_str().unwrap().to_string();

    for _ in 0..2 {
        let response = client()
            .get(gateway.url("/api/users/1"))
            .header("x-api-key", &key)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }
    let third = client()
        .get(gateway.url("/api/users/1"))
        .header("x-api-key", &key)
        .send()
        .await
        .unwrap();
    assert_eq!(third.status(), 429);
}

#[tokio::test]
async fn test_health_endpoint_reports_services() {
    let upstream = spawn_upstream().await;
    let mut config = base_config();
    config
        .routing
        .services
        .push(service("users", "/api/users", vec![upstream.instance()]));
    let gateway = spawn_gateway(config).await;

    let body: serde_json::Value = client()
        .get(gateway.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["services"]["users"]["healthy"], true);
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_metrics_requires_admin() {
    let gateway = spawn_gateway(base_config()).await;

    let anonymous = client().get(gateway.url("/metrics")).send().await.unwrap();
    assert_eq!(anonymous.status(), 401);

    let non_admin = user_auth(client().get(gateway.url("/metrics")))
        .send()
        .await
        .unwrap();
    assert_eq!(non_admin.status(), 403);

    let admin = admin_auth(client().get(gateway.url("/metrics")))
        .send()
        .await
        .unwrap();
    assert_eq!(admin.status(), 200);
    let body: serde_json::Value = admin.json().await.unwrap();
    assert!(body["requests"]["total"].is_number());
}

#[tokio::test]
async fn test_admin_circuit_listing_and_reset() {
    let upstream = spawn_upstream().await;
    upstream.set_status(500);
    let mut config = base_config();
    config
        .routing
        .services
        .push(service("users", "/api/users", vec![upstream.instance()]));
    config.circuit_breaker = CircuitBreakerConfig {
        error_count: 2,
        error_threshold: 50,
        reset_timeout_ms: 60_000,
        ..CircuitBreakerConfig::default()
    };
    let gateway = spawn_gateway(config).await;

    for _ in 0..2 {
        user_auth(client().get(gateway.url("/api/users/1")))
            .send()
            .await
            .unwrap();
    }
    // Circuit is now open; the next call short-circuits
    let rejected = user_auth(client().get(gateway.url("/api/users/1")))
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), 503);

    let circuits: serde_json::Value = admin_auth(client().get(gateway.url("/admin/circuits")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let users = circuits["circuits"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["service"] == "users")
        .unwrap();
    assert_eq!(users["state"], "open");

    let reset = admin_auth(client().post(gateway.url("/admin/circuits/users/reset")))
        .send()
        .await
        .unwrap();
    assert_eq!(reset.status(), 200);

    upstream.set_status(200);
    let after = user_auth(client().get(gateway.url("/api/users/1")))
        .send()
        .await
        .unwrap();
    assert_eq!(after.status(), 200);
}

#[tokio::test]
async fn test_plugin_stamp_applied_to_responses() {
    let upstream = spawn_upstream().await;
    let mut config = base_config();
    config.plugins.load = vec!["response-stamp".to_string()];
    config
        .routing
        .services
        .push(service("users", "/api/users", vec![upstream.instance()]));
    let gateway = spawn_gateway(config).await;

    let response = user_auth(client().get(gateway.url("/api/users/1")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.headers().get("x-plugin-stamp").unwrap(), "portico");
}

#[tokio::test]
async fn test_admin_cache_flush() {
    let upstream = spawn_upstream().await;
    let mut config = base_config();
    config
        .routing
        .services
        .push(service("users", "/api/users", vec![upstream.instance()]));
    let gateway = spawn_gateway(config).await;

    user_auth(client().get(gateway.url("/api/users/1")))
        .send()
        .await
        .unwrap();
    let hit = user_auth(client().get(gateway.url("/api/users/1")))
        .send()
        .await
        .unwrap();
    assert_eq!(hit.headers().get("x-cache").unwrap(), "HIT");

    let flush = admin_auth(client().post(gateway.url("/admin/cache/flush")))
        .send()
        .await
        .unwrap();
    assert_eq!(flush.status(), 200);

    let after = user_auth(client().get(gateway.url("/api/users/1")))
        .send()
        .await
        .unwrap();
    assert_eq!(after.headers().get("x-cache").unwrap(), "MISS");
}
