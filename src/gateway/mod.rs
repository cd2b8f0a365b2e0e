// ============================================================================
// Pipeline Orchestrator
// ============================================================================
//
// Composes the stages in a fixed order with uniform failure semantics:
//
//   Security -> RateLimit -> RequestTransform -> (beforeAuth) -> Auth ->
//   (afterAuth) -> (beforeCache) -> CacheLookup -> (afterCache) ->
//   (beforeRouting) -> CircuitGate -> Route -> (afterRouting) -> Proxy ->
//   (beforeResponse) -> ResponseTransform -> emit -> (afterResponse)
//
// Any stage may short-circuit by producing a terminal response or an
// error; later mutating stages are skipped but every hook still fires.
// Error mapping, gateway header injection and metric recording happen
// here and nowhere else.
//
// ============================================================================

pub mod balancer;
pub mod circuit_breaker;
pub mod health;
pub mod proxy;

use crate::context::{CacheStatus, Outcome, QuotaSnapshot, RequestContext, TerminalResponse};
use crate::error::GatewayError;
use crate::plugins::{ContextPatch, Hook, HookContext};
use crate::state::AppState;
use crate::utils::{add_security_headers, extract_client_ip, now_epoch_ms};
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

pub const GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A single pipeline stage.
#[async_trait]
trait Stage: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, state: &Arc<AppState>, ctx: &mut RequestContext) -> Outcome;
}

struct PipelineEntry {
    before: Option<Hook>,
    stage: Box<dyn Stage>,
    after: Option<Hook>,
}

fn pipeline() -> Vec<PipelineEntry> {
    fn entry(before: Option<Hook>, stage: Box<dyn Stage>, after: Option<Hook>) -> PipelineEntry {
        PipelineEntry {
            before,
            stage,
            after,
        }
    }
    vec![
        entry(None, Box::new(SecurityStage), None),
        entry(None, Box::new(RateLimitStage), None),
        entry(None, Box::new(RequestTransformStage), None),
        entry(Some(Hook::BeforeAuth), Box::new(AuthStage), Some(Hook::AfterAuth)),
        entry(
            Some(Hook::BeforeCache),
            Box::new(CacheLookupStage),
            Some(Hook::AfterCache),
        ),
        entry(Some(Hook::BeforeRouting), Box::new(CircuitGateStage), None),
        entry(None, Box::new(RouteStage), Some(Hook::AfterRouting)),
        entry(None, Box::new(ProxyStage), None),
        entry(
            Some(Hook::BeforeResponse),
            Box::new(ResponseTransformStage),
            None,
        ),
    ]
}

// ============================================================================
// Entry point
// ============================================================================

/// Axum handler for everything under /api: builds the context, runs the
/// pipeline, emits exactly one response.
pub async fn handle_request(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let client_ip = extract_client_ip(&parts.headers, Some(&peer.ip().to_string()));
    let query = crate::context::parse_query(parts.uri.query());

    let body = match axum::body::to_bytes(body, state.config.server.body_limit_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            let err = GatewayError::Validation("Request body too large".to_string());
            return err.into_response_with_headers();
        }
    };

    let mut ctx = RequestContext::new(
        client_ip,
        parts.method.clone(),
        parts.uri.path().to_string(),
        query,
        parts.headers.clone(),
        body,
    );

    run_pipeline(&state, &mut ctx).await
}

async fn run_pipeline(state: &Arc<AppState>, ctx: &mut RequestContext) -> Response {
    let mut response_header_patches: Vec<(String, String)> = Vec::new();

    fire_hook(state, ctx, Hook::BeforeRequest, &mut response_header_patches).await;

    for entry in pipeline() {
        if let Some(hook) = entry.before {
            fire_hook(state, ctx, hook, &mut response_header_patches).await;
        }
        // Terminal or failed: mutating stages are skipped, hooks still fire
        if !ctx.is_terminal() && ctx.error.is_none() {
            let started = Instant::now();
            let outcome = entry.stage.run(state, ctx).await;
            ctx.stage_timings
                .push((entry.stage.name(), started.elapsed().as_micros()));
            match outcome {
                Outcome::Continue => {}
                Outcome::Terminal(response) => ctx.set_terminal(response),
                Outcome::Fail(err) => ctx.error = Some(err),
            }
        }
        if let Some(hook) = entry.after {
            fire_hook(state, ctx, hook, &mut response_header_patches).await;
        }
    }

    fire_hook(state, ctx, Hook::AfterRequest, &mut response_header_patches).await;

    // An admitted half-open probe whose upstream call never ran must give
    // its permit back.
    if ctx.circuit_probe_pending {
        if let Some(service) = &ctx.circuit_service {
            state.breakers.release_probe(service);
        }
        ctx.circuit_probe_pending = false;
    }

    let response = finalize(state, ctx, response_header_patches).await;

    let status = response.status().as_u16();
    state.monitor.record(
        ctx.method.as_str(),
        &ctx.path,
        status,
        ctx.received_at.elapsed().as_millis() as u64,
    );

    let mut patches = Vec::new();
    if ctx.error.is_some() {
        fire_hook(state, ctx, Hook::OnError, &mut patches).await;
    }
    fire_hook(state, ctx, Hook::AfterResponse, &mut patches).await;

    response
}

/// Build the final HTTP response: terminal or mapped error, plus the
/// gateway-identifying, rate-limit, cache and security headers.
async fn finalize(
    state: &Arc<AppState>,
    ctx: &mut RequestContext,
    response_header_patches: Vec<(String, String)>,
) -> Response {
    let production = state.config.is_production();

    // Clone rather than take: the afterResponse hook still reads the
    // terminal's status, and the body Bytes clone is refcounted.
    let terminal = match (&ctx.error, ctx.terminal.clone()) {
        (Some(err), _) => {
            err.log(&ctx.request_id);
            let mut response = TerminalResponse::json(
                err.status_code(),
                &err.body(&ctx.request_id, production),
            );
            if let Some(retry_after) = err.retry_after_secs() {
                if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                    response.headers.insert("retry-after", value);
                }
            }
            response
        }
        (None, Some(terminal)) => terminal,
        (None, None) => {
            // Every stage ran without producing a response: programmer error
            let err = GatewayError::Internal("Pipeline produced no response".to_string());
            err.log(&ctx.request_id);
            TerminalResponse::json(err.status_code(), &err.body(&ctx.request_id, production))
        }
    };

    let mut builder = Response::builder().status(terminal.status);
    let headers = builder.headers_mut().expect("fresh builder");
    *headers = terminal.headers;

    insert_header(headers, "x-gateway-version", GATEWAY_VERSION);
    insert_header(headers, "x-request-id", &ctx.request_id);
    insert_header(
        headers,
        "x-response-time",
        &format!("{}ms", ctx.received_at.elapsed().as_millis()),
    );
    if ctx.cache_status != CacheStatus::Bypass {
        insert_header(headers, "x-cache", ctx.cache_status.as_str());
        if let Some(key) = &ctx.cache_key {
            insert_header(headers, "x-cache-key", key);
        }
    }
    if let Some(quota) = &ctx.quota {
        insert_header(headers, "x-ratelimit-limit", &quota.limit.to_string());
        insert_header(
            headers,
            "x-ratelimit-remaining",
            &quota.remaining.to_string(),
        );
        insert_header(
            headers,
            "x-ratelimit-reset",
            &quota.reset_epoch_secs.to_string(),
        );
    }
    for (name, value) in response_header_patches {
        insert_header_owned(headers, &name, &value);
    }
    add_security_headers(headers);

    builder
        .body(Body::from(terminal.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response_plain())
}

fn insert_header(headers: &mut axum::http::HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

fn insert_header_owned(headers: &mut axum::http::HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        headers.insert(name, value);
    }
}

async fn fire_hook(
    state: &Arc<AppState>,
    ctx: &mut RequestContext,
    hook: Hook,
    response_header_patches: &mut Vec<(String, String)>,
) {
    let view = HookContext {
        request_id: ctx.request_id.clone(),
        client_ip: ctx.client_ip.clone(),
        method: ctx.method.to_string(),
        path: ctx.path.clone(),
        service: ctx.service.clone(),
        instance: ctx.instance.clone(),
        status: ctx
            .terminal
            .as_ref()
            .map(|t| t.status.as_u16())
            .or_else(|| ctx.error.as_ref().map(|e| e.status_code().as_u16())),
        error: ctx.error.as_ref().map(|e| e.to_string()),
        attributes: ctx.attributes.clone(),
    };
    let patch = state.plugins.fire(hook, &view).await;
    apply_patch(ctx, patch, response_header_patches);
}

/// Merge a plugin patch over the live context.
fn apply_patch(
    ctx: &mut RequestContext,
    patch: ContextPatch,
    response_header_patches: &mut Vec<(String, String)>,
) {
    if patch.is_empty() {
        return;
    }
    for (name, value) in patch.request_headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            ctx.headers.insert(name, value);
        }
    }
    response_header_patches.extend(patch.response_headers);
    ctx.attributes.extend(patch.attributes);
}

// ============================================================================
// Stages
// ============================================================================

struct SecurityStage;

#[async_trait]
impl Stage for SecurityStage {
    fn name(&self) -> &'static str {
        "security"
    }

    async fn run(&self, state: &Arc<AppState>, ctx: &mut RequestContext) -> Outcome {
        match state.security.check(ctx) {
            Ok(()) => Outcome::Continue,
            Err(err) => Outcome::Fail(err),
        }
    }
}

struct RateLimitStage;

#[async_trait]
impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn run(&self, state: &Arc<AppState>, ctx: &mut RequestContext) -> Outcome {
        if !state.rate_limiter.config().enabled {
            return Outcome::Continue;
        }
        let now = now_epoch_ms();
        let decision = state.rate_limiter.check_global(&ctx.client_ip, now);
        ctx.quota = Some(QuotaSnapshot {
            limit: decision.limit,
            remaining: decision.remaining,
            reset_epoch_secs: decision.reset_epoch_secs,
        });
        if !decision.allowed {
            tracing::warn!(
                ip = %ctx.client_ip,
                limit = decision.limit,
                "Global rate limit exceeded"
            );
            return Outcome::Fail(GatewayError::RateLimited {
                reason: format!(
                    "Too many requests from this IP: limit {} per window",
                    decision.limit
                ),
                retry_after_secs: decision.retry_after_secs,
            });
        }
        // Latency injection, never a rejection
        if let Some(delay) = state.rate_limiter.slow_down_delay(&ctx.client_ip, now) {
            tracing::debug!(ip = %ctx.client_ip, delay_ms = delay.as_millis() as u64, "Slowing down request");
            tokio::time::sleep(delay).await;
        }
        Outcome::Continue
    }
}

struct RequestTransformStage;

#[async_trait]
impl Stage for RequestTransformStage {
    fn name(&self) -> &'static str {
        "request_transform"
    }

    async fn run(&self, state: &Arc<AppState>, ctx: &mut RequestContext) -> Outcome {
        match state.transformer.transform_request(ctx) {
            Ok(()) => Outcome::Continue,
            Err(err) => Outcome::Fail(err),
        }
    }
}

struct AuthStage;

#[async_trait]
impl Stage for AuthStage {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn run(&self, state: &Arc<AppState>, ctx: &mut RequestContext) -> Outcome {
        let principal = match state.auth.verify_request(&ctx.headers).await {
            Ok(principal) => principal,
            Err(err) => return Outcome::Fail(err),
        };

        // Per-identity quota, checked once the principal is known. The
        // API key record may override the configured defaults.
        if state.rate_limiter.config().enabled {
            let (limit_override, window_override) = principal
                .api_key
                .as_ref()
                .map(|k| (k.quota_max_requests, k.quota_window_ms))
                .unwrap_or((None, None));
            let decision = state.rate_limiter.check_identity(
                &principal.quota_key(),
                limit_override,
                window_override,
                now_epoch_ms(),
            );
            ctx.quota = Some(QuotaSnapshot {
                limit: decision.limit,
                remaining: decision.remaining,
                reset_epoch_secs: decision.reset_epoch_secs,
            });
            if !decision.allowed {
                return Outcome::Fail(GatewayError::RateLimited {
                    reason: format!("Quota exceeded: limit {} per window", decision.limit),
                    retry_after_secs: decision.retry_after_secs,
                });
            }
        }

        ctx.principal = Some(principal);
        Outcome::Continue
    }
}

struct CacheLookupStage;

#[async_trait]
impl Stage for CacheLookupStage {
    fn name(&self) -> &'static str {
        "cache_lookup"
    }

    async fn run(&self, state: &Arc<AppState>, ctx: &mut RequestContext) -> Outcome {
        if !state.cache.is_cacheable_request(ctx) {
            ctx.cache_status = CacheStatus::Bypass;
            return Outcome::Continue;
        }
        let key = state.cache.build_key(ctx);
        ctx.cache_key = Some(key.clone());
        match state.cache.lookup(&key).await {
            Some(cached) => {
                ctx.cache_status = CacheStatus::Hit;
                tracing::debug!(key = %key, "Cache hit");
                Outcome::Terminal(cached)
            }
            None => {
                ctx.cache_status = CacheStatus::Miss;
                Outcome::Continue
            }
        }
    }
}

struct CircuitGateStage;

#[async_trait]
impl Stage for CircuitGateStage {
    fn name(&self) -> &'static str {
        "circuit_gate"
    }

    async fn run(&self, state: &Arc<AppState>, ctx: &mut RequestContext) -> Outcome {
        // No derivable service key: the breaker is bypassed
        let Some(service) = circuit_breaker::service_key(&ctx.path, &ctx.headers) else {
            return Outcome::Continue;
        };
        match state.breakers.try_acquire(&service) {
            Ok(()) => {
                ctx.circuit_service = Some(service);
                ctx.circuit_probe_pending = true;
                Outcome::Continue
            }
            Err(err) => Outcome::Fail(err),
        }
    }
}

struct RouteStage;

#[async_trait]
impl Stage for RouteStage {
    fn name(&self) -> &'static str {
        "route"
    }

    async fn run(&self, state: &Arc<AppState>, ctx: &mut RequestContext) -> Outcome {
        let Some(service) = state.services.find_by_path(&ctx.path) else {
            return Outcome::Fail(GatewayError::NotFound(format!(
                "No service for path {}",
                ctx.path
            )));
        };
        match service.select(&ctx.client_ip) {
            Ok(instance) => {
                ctx.service = Some(service.config.name.clone());
                ctx.instance = Some(instance.address());
                Outcome::Continue
            }
            Err(err) => Outcome::Fail(err),
        }
    }
}

struct ProxyStage;

#[async_trait]
impl Stage for ProxyStage {
    fn name(&self) -> &'static str {
        "proxy"
    }

    async fn run(&self, state: &Arc<AppState>, ctx: &mut RequestContext) -> Outcome {
        let (Some(service_name), Some(instance_addr)) = (&ctx.service, &ctx.instance) else {
            return Outcome::Fail(GatewayError::Internal(
                "Proxy reached without routing decision".to_string(),
            ));
        };
        let Some(service) = state.services.find_by_name(service_name) else {
            return Outcome::Fail(GatewayError::Internal(format!(
                "Routed service '{}' disappeared",
                service_name
            )));
        };
        let Some(instance) = service
            .instances
            .iter()
            .find(|i| &i.address() == instance_addr)
            .cloned()
        else {
            return Outcome::Fail(GatewayError::Internal(format!(
                "Routed instance '{}' disappeared",
                instance_addr
            )));
        };

        // The breaker's per-call timeout wraps the service timeout when a
        // circuit guards this request.
        let mut timeout = std::time::Duration::from_millis(service.config.timeout_ms);
        if let Some(circuit) = &ctx.circuit_service {
            timeout = timeout.min(state.breakers.upstream_timeout(circuit));
        }

        instance.connection_opened();
        let result = state
            .upstream
            .forward(ctx, &service, &instance, timeout)
            .await;
        instance.connection_closed();

        let circuit = ctx.circuit_service.clone();
        match result {
            Ok(response) => {
                instance.record_success();
                if let Some(circuit) = &circuit {
                    if response.status.is_server_error() {
                        state.breakers.record_failure(circuit, false);
                    } else {
                        state.breakers.record_success(circuit);
                    }
                    ctx.circuit_probe_pending = false;
                }
                ctx.upstream_response = Some(response);
                Outcome::Continue
            }
            Err(proxy::ProxyError::Timeout) => {
                instance.record_failure();
                if let Some(circuit) = &circuit {
                    state.breakers.record_failure(circuit, true);
                    ctx.circuit_probe_pending = false;
                }
                Outcome::Fail(GatewayError::UpstreamTimeout {
                    service: service.config.name.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Err(proxy::ProxyError::Connection(detail)) => {
                instance.record_failure();
                if let Some(circuit) = &circuit {
                    state.breakers.record_failure(circuit, false);
                    ctx.circuit_probe_pending = false;
                }
                tracing::error!(
                    service = %service.config.name,
                    instance = %instance.address(),
                    error = %detail,
                    "Upstream connection failed"
                );
                Outcome::Fail(GatewayError::BadGateway(format!(
                    "Upstream connection failed for {}",
                    service.config.name
                )))
            }
        }
    }
}

struct ResponseTransformStage;

#[async_trait]
impl Stage for ResponseTransformStage {
    fn name(&self) -> &'static str {
        "response_transform"
    }

    async fn run(&self, state: &Arc<AppState>, ctx: &mut RequestContext) -> Outcome {
        let Some(mut response) = ctx.upstream_response.take() else {
            return Outcome::Fail(GatewayError::Internal(
                "Response transform reached without an upstream response".to_string(),
            ));
        };

        if let Err(err) = state.transformer.transform_response(ctx, &mut response) {
            return Outcome::Fail(err);
        }

        // Write path: store the final transformed representation so later
        // hits are byte-identical to this response.
        if ctx.cache_status == CacheStatus::Miss {
            if let Some(key) = &ctx.cache_key {
                if state.cache.is_cacheable_response(&response) {
                    let ttl = state.cache.ttl_for(&ctx.path, &response.headers);
                    state.cache.store_response(key, &response, ttl).await;
                }
            }
        }

        // Keyed invalidation runs after the response is on its way,
        // best-effort.
        if response.status.is_success() || response.status.is_redirection() {
            let prefixes = state.cache.invalidation_prefixes(&ctx.method, &ctx.path);
            if !prefixes.is_empty() {
                let state = state.clone();
                tokio::spawn(async move {
                    for prefix in prefixes {
                        state.cache.invalidate_prefix(&prefix).await;
                    }
                });
            }
        }

        Outcome::Terminal(response)
    }
}

trait IntoResponsePlain {
    fn into_response_plain(self) -> Response;
}

impl IntoResponsePlain for StatusCode {
    fn into_response_plain(self) -> Response {
        Response::builder()
            .status(self)
            .body(Body::empty())
            .expect("static response")
    }
}

impl GatewayError {
    /// Response for failures before a context exists (e.g. oversized body).
    pub fn into_response_with_headers(self) -> Response {
        use axum::response::IntoResponse;
        let mut response = self.into_response();
        add_security_headers(response.headers_mut());
        response
    }
}
