// ============================================================================
// Gateway Configuration
// ============================================================================
//
// Configuration is merged from three layers, strongest last:
// 1. Compiled defaults (the serde default functions below)
// 2. Optional JSON file named by PORTICO_CONFIG, deep-merged: nested
//    objects combine recursively, scalars and arrays replace wholesale
// 3. Environment variables for the operational knobs
//
// ============================================================================

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// Default port values
const DEFAULT_PORT: u16 = 8080;

// Time conversion constants
pub const MILLIS_PER_SECOND: u64 = 1000;
pub const SECONDS_PER_MINUTE: u64 = 60;
pub const SECONDS_PER_HOUR: u64 = 3600;

// Request size limits (in bytes)
pub const MAX_REQUEST_BODY_SIZE: usize = 2 * 1024 * 1024; // 2 MB HTTP API requests
pub const MAX_HEADER_VALUE_SIZE: usize = 8 * 1024; // 8 KiB per header value
pub const MAX_SCALAR_VALUE_SIZE: usize = 10 * 1024; // 10 KiB per body scalar
pub const MAX_BODY_NESTING_DEPTH: usize = 10;

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// "production" suppresses internal error detail in responses.
    pub environment: String,
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub routing: RoutingConfig,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub security: SecurityConfig,
    pub monitoring: MonitoringConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub transformation: TransformationConfig,
    pub limits: LimitsConfig,
    pub documentation: DocumentationConfig,
    pub plugins: PluginsConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            environment: "development".to_string(),
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            routing: RoutingConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            security: SecurityConfig::default(),
            monitoring: MonitoringConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            transformation: TransformationConfig::default(),
            limits: LimitsConfig::default(),
            documentation: DocumentationConfig::default(),
            plugins: PluginsConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Request handling timeout, also the shutdown drain grace.
    pub timeout_ms: u64,
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            body_limit_bytes: MAX_REQUEST_BODY_SIZE,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub token_ttl_secs: i64,
    /// Which credential kinds are accepted, tried in this order:
    /// API key header, bearer token, basic.
    pub api_key_enabled: bool,
    pub jwt_enabled: bool,
    pub basic_enabled: bool,
    pub api_key_header: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            jwt_issuer: "portico".to_string(),
            token_ttl_secs: 3600,
            api_key_enabled: true,
            jwt_enabled: true,
            basic_enabled: true,
            api_key_header: "x-api-key".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoutingConfig {
    pub services: Vec<ServiceConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceConfig {
    pub name: String,
    /// Path prefix this service claims, e.g. "/api/users".
    pub path_prefix: String,
    /// Remove the prefix before forwarding upstream.
    pub strip_prefix: bool,
    pub instances: Vec<InstanceConfig>,
    pub policy: LoadBalancingPolicy,
    pub timeout_ms: u64,
    pub health_check: HealthCheckConfig,
    /// Per-service circuit breaker overrides; None inherits the global block.
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            path_prefix: String::new(),
            strip_prefix: false,
            instances: Vec::new(),
            policy: LoadBalancingPolicy::RoundRobin,
            timeout_ms: 30_000,
            health_check: HealthCheckConfig::default(),
            circuit_breaker: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InstanceConfig {
    pub host: String,
    pub port: u16,
    pub weight: u32,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 80,
            weight: 1,
        }
    }
}

impl InstanceConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoadBalancingPolicy {
    RoundRobin,
    WeightedRoundRobin,
    LeastConn,
    Random,
    IpHash,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HealthCheckConfig {
    pub path: String,
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: "/health".to_string(),
            interval_ms: 30_000,
            timeout_ms: 5_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Global fixed window keyed by client IP.
    pub window_ms: u64,
    pub max_requests: u32,
    /// Per-identity quota defaults; API key records may override.
    pub quota_window_ms: u64,
    pub quota_max_requests: u32,
    pub slow_down: SlowDownConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 15 * SECONDS_PER_MINUTE * MILLIS_PER_SECOND,
            max_requests: 1000,
            quota_window_ms: SECONDS_PER_HOUR * MILLIS_PER_SECOND,
            quota_max_requests: 5000,
            slow_down: SlowDownConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SlowDownConfig {
    pub enabled: bool,
    pub window_ms: u64,
    /// Requests in the window before delays start.
    pub delay_after: u32,
    /// Added per request beyond the threshold.
    pub delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for SlowDownConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_ms: 15 * SECONDS_PER_MINUTE * MILLIS_PER_SECOND,
            delay_after: 500,
            delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    pub enabled: bool,
    pub redis_url: Option<String>,
    pub key_prefix: String,
    pub default_ttl_secs: u64,
    pub cacheable_methods: Vec<String>,
    pub cacheable_status_codes: Vec<u16>,
    /// Per-path TTL strategies, longest prefix wins.
    pub path_ttls: Vec<PathTtlConfig>,
    /// Methods whose success invalidates entries under a prefix.
    pub invalidation_rules: Vec<InvalidationRuleConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redis_url: None,
            key_prefix: "gw:cache:".to_string(),
            default_ttl_secs: 300,
            cacheable_methods: vec!["GET".to_string(), "HEAD".to_string()],
            cacheable_status_codes: vec![200, 201, 202, 203, 204, 206, 301, 302, 304],
            path_ttls: Vec::new(),
            invalidation_rules: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PathTtlConfig {
    pub path_prefix: String,
    pub ttl_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InvalidationRuleConfig {
    pub path_prefix: String,
    pub methods: Vec<String>,
}

impl Default for InvalidationRuleConfig {
    fn default() -> Self {
        Self {
            path_prefix: String::new(),
            methods: vec![
                "POST".to_string(),
                "PUT".to_string(),
                "PATCH".to_string(),
                "DELETE".to_string(),
            ],
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SecurityConfig {
    pub enabled: bool,
    /// Authoritative when non-empty; otherwise the deny list blocks.
    pub ip_allow_list: Vec<String>,
    pub ip_deny_list: Vec<String>,
    pub threat_detection_enabled: bool,
    /// Violations within one hour before an IP is auto-denied.
    pub max_violations_per_hour: u32,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ip_allow_list: Vec::new(),
            ip_deny_list: Vec::new(),
            threat_detection_enabled: true,
            max_violations_per_hour: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MonitoringConfig {
    pub enabled: bool,
    pub resource_sample_interval_ms: u64,
    pub alert_response_time_ms: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            resource_sample_interval_ms: 10_000,
            alert_response_time_ms: 5_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    /// Per-upstream call timeout.
    pub timeout_ms: u64,
    /// Minimum failures before the circuit can open.
    pub error_count: u32,
    /// Failure percentage (0-100) that must also be reached.
    pub error_threshold: u32,
    pub reset_timeout_ms: u64,
    /// Concurrent probes admitted in half-open, and the consecutive
    /// successes required to close.
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            error_count: 5,
            error_threshold: 50,
            reset_timeout_ms: 30_000,
            half_open_requests: 3,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransformationConfig {
    pub enabled: bool,
    /// Attach the `_gateway` envelope to JSON response bodies.
    pub attach_metadata: bool,
    pub sanitize_queries: bool,
    pub rules: Vec<TransformRuleConfig>,
}

impl Default for TransformationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            attach_metadata: false,
            sanitize_queries: true,
            rules: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransformRuleConfig {
    pub path_prefix: String,
    pub request: Vec<TransformOpConfig>,
    pub response: Vec<TransformOpConfig>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransformOpConfig {
    /// "headers" | "query" | "body"
    pub target: String,
    /// "add" | "remove" | "rename" | "transform"
    pub action: String,
    /// Header/query name, or dotted body path.
    pub path: String,
    /// Value for add, new name for rename.
    pub value: Option<serde_json::Value>,
    /// Named function for transform.
    pub function: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LimitsConfig {
    pub max_header_value_bytes: usize,
    pub max_scalar_value_bytes: usize,
    pub max_body_depth: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_header_value_bytes: MAX_HEADER_VALUE_SIZE,
            max_scalar_value_bytes: MAX_SCALAR_VALUE_SIZE,
            max_body_depth: MAX_BODY_NESTING_DEPTH,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DocumentationConfig {
    pub enabled: bool,
}

impl Default for DocumentationConfig {
    fn default() -> Self {
        Self { enabled: false }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PluginsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Names resolved against the compiled plugin factory at startup.
    pub load: Vec<String>,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            load: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration: defaults, then the optional JSON file, then
    /// environment variables.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match std::env::var("PORTICO_CONFIG").ok() {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON configuration file over the compiled defaults.
    ///
    /// Deep merge falls out of the serde defaults: every absent key takes
    /// its default, nested objects merge per field, present scalars and
    /// arrays replace wholesale.
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path))?;
        let config: GatewayConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path))?;
        Ok(config)
    }

    /// Environment variable overrides for the operational knobs.
    fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("HOST") {
            self.host = host;
        }
        if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
            self.port = port;
        }
        if let Ok(env) = std::env::var("PORTICO_ENV") {
            self.environment = env;
        }
        if let Ok(secret) = std::env::var("JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Ok(issuer) = std::env::var("JWT_ISSUER") {
            self.auth.jwt_issuer = issuer;
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            self.cache.redis_url = Some(url);
        }
        if let Some(max) = std::env::var("RATE_LIMIT_MAX_REQUESTS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.rate_limit.max_requests = max;
        }
        if let Some(window) = std::env::var("RATE_LIMIT_WINDOW_MS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.rate_limit.window_ms = window;
        }
        if let Some(ttl) = std::env::var("CACHE_DEFAULT_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.cache.default_ttl_secs = ttl;
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Reject configurations the runtime cannot operate under.
    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_enabled && self.auth.jwt_secret.len() < 32 {
            anyhow::bail!(
                "JWT_SECRET must be at least 32 characters when JWT auth is enabled. \
                 Generate one with: openssl rand -base64 32"
            );
        }
        self.validate_breaker(&self.circuit_breaker, "global")?;
        for service in &self.routing.services {
            if service.name.is_empty() {
                anyhow::bail!("Service with prefix '{}' has no name", service.path_prefix);
            }
            if service.path_prefix.is_empty() {
                anyhow::bail!("Service '{}' has no path prefix", service.name);
            }
            if let Some(breaker) = &service.circuit_breaker {
                self.validate_breaker(breaker, &service.name)?;
            }
        }
        if self.rate_limit.window_ms == 0 || self.rate_limit.quota_window_ms == 0 {
            anyhow::bail!("Rate limit windows must be non-zero");
        }
        Ok(())
    }

    fn validate_breaker(&self, breaker: &CircuitBreakerConfig, scope: &str) -> Result<()> {
        // half_open_requests = 0 would leave an open circuit unable to close
        if breaker.half_open_requests == 0 {
            anyhow::bail!(
                "circuitBreaker.halfOpenRequests must be >= 1 ({} scope): \
                 a breaker that admits no probes can never close",
                scope
            );
        }
        if breaker.error_threshold > 100 {
            anyhow::bail!(
                "circuitBreaker.errorThreshold is a percentage, got {} ({} scope)",
                breaker.error_threshold,
                scope
            );
        }
        Ok(())
    }

    /// Effective breaker parameters for a service.
    pub fn breaker_for(&self, service: &str) -> CircuitBreakerConfig {
        self.routing
            .services
            .iter()
            .find(|s| s.name == service)
            .and_then(|s| s.circuit_breaker.clone())
            .unwrap_or_else(|| self.circuit_breaker.clone())
    }
}
