// ============================================================================
// Application State
// ============================================================================
//
// One AppState is built at startup and shared (Arc) by the HTTP surface,
// the pipeline and the background tasks. Components own their shared
// mutable state internally; AppState itself is immutable after build.
//
// ============================================================================

use crate::auth::AuthManager;
use crate::cache::store::TieredStore;
use crate::cache::ResponseCache;
use crate::config::GatewayConfig;
use crate::gateway::balancer::ServiceRegistry;
use crate::gateway::circuit_breaker::CircuitBreakerRegistry;
use crate::gateway::proxy::UpstreamClient;
use crate::monitor::Monitor;
use crate::plugins::PluginEngine;
use crate::rate_limit::RateLimiter;
use crate::security::SecurityFilter;
use crate::transform::Transformer;
use anyhow::Result;
use std::sync::Arc;

pub struct AppState {
    pub config: GatewayConfig,
    pub store: Arc<TieredStore>,
    pub auth: AuthManager,
    pub rate_limiter: RateLimiter,
    pub cache: ResponseCache,
    pub breakers: CircuitBreakerRegistry,
    pub services: ServiceRegistry,
    pub upstream: UpstreamClient,
    pub transformer: Transformer,
    pub security: SecurityFilter,
    pub plugins: PluginEngine,
    pub monitor: Monitor,
}

impl AppState {
    pub async fn build(config: GatewayConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let store = Arc::new(TieredStore::connect(config.cache.redis_url.as_deref()).await);
        let auth = AuthManager::new(config.auth.clone(), store.clone());
        let rate_limiter = RateLimiter::new(config.rate_limit.clone());
        let cache = ResponseCache::new(config.cache.clone(), store.clone());

        let breaker_configs = config.clone();
        let breakers =
            CircuitBreakerRegistry::new(move |service| breaker_configs.breaker_for(service));

        let services = ServiceRegistry::new(config.routing.services.clone());
        let security = SecurityFilter::new(config.security.clone(), config.limits.clone());
        let transformer = Transformer::new(config.transformation.clone());
        let monitor = Monitor::new(config.monitoring.clone());

        let plugins = PluginEngine::new();
        if config.plugins.enabled {
            for name in &config.plugins.load {
                if let Err(e) = plugins.load(name).await {
                    tracing::warn!(plugin = %name, error = %e, "Failed to load plugin");
                }
            }
        }
        plugins.startup().await;

        Ok(Arc::new(Self {
            config,
            store,
            auth,
            rate_limiter,
            cache,
            breakers,
            services,
            upstream: UpstreamClient::new(),
            transformer,
            security,
            plugins,
            monitor,
        }))
    }
}
