// ============================================================================
// Response Cache
// ============================================================================
//
// Policy layer over the tiered store: keying, cacheability rules, TTL
// selection and keyed invalidation.
//
// Keys embed the canonical request path ahead of a hash of the remaining
// dimensions (method, sorted query, content-negotiation headers) so that
// per-prefix invalidation rules can pattern-match stored keys.
//
// ============================================================================

pub mod store;

use crate::auth::AuthMethod;
use crate::config::CacheConfig;
use crate::context::{RequestContext, TerminalResponse};
use crate::utils::{now_epoch_ms, sha256_hex};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use store::TieredStore;

/// Response headers preserved in a cache entry.
const PRESERVED_HEADERS: &[&str] = &[
    "content-type",
    "content-length",
    "etag",
    "last-modified",
    "cache-control",
];

/// Request headers that participate in the cache key.
const VARY_HEADERS: &[&str] = &["accept", "accept-language", "accept-encoding"];

/// Request headers that mark a request uncacheable. The credential the
/// gateway itself validated is exempt, otherwise the mandatory auth stage
/// would make every pipeline request uncacheable.
const SENSITIVE_HEADERS: &[&str] = &["authorization", "cookie", "x-api-key"];

#[derive(Serialize, Deserialize)]
struct CacheEntry {
    status: u16,
    headers: Vec<(String, String)>,
    body_b64: String,
    stored_at_ms: u64,
}

pub struct ResponseCache {
    config: CacheConfig,
    store: Arc<TieredStore>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig, store: Arc<TieredStore>) -> Self {
        Self { config, store }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    // ========================================================================
    // Keying
    // ========================================================================

    /// `prefix + canonical-path + ':' + hash(method:path?sorted-query|vary)`.
    pub fn build_key(&self, ctx: &RequestContext) -> String {
        let vary = VARY_HEADERS
            .iter()
            .map(|name| {
                ctx.headers
                    .get(*name)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
            })
            .collect::<Vec<_>>()
            .join(",");
        let canonical = format!(
            "{}:{}?{}|{}",
            ctx.method,
            ctx.path,
            ctx.sorted_query(),
            vary
        );
        format!(
            "{}{}:{}",
            self.config.key_prefix,
            path_scope(&ctx.path),
            sha256_hex(&canonical)
        )
    }

    // ========================================================================
    // Cacheability
    // ========================================================================

    /// Whether the request may participate in caching at all.
    pub fn is_cacheable_request(&self, ctx: &RequestContext) -> bool {
        if !self.config.enabled {
            return false;
        }
        if !self.method_cacheable(&ctx.method) {
            return false;
        }
        let consumed = ctx.principal.as_ref().map(|p| match p.method {
            AuthMethod::ApiKey => "x-api-key",
            AuthMethod::Jwt | AuthMethod::Basic => "authorization",
        });
        for header in SENSITIVE_HEADERS {
            if ctx.headers.contains_key(*header) && consumed != Some(*header) {
                return false;
            }
        }
        true
    }

    fn method_cacheable(&self, method: &Method) -> bool {
        self.config
            .cacheable_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method.as_str()))
    }

    /// Whether the outbound response qualifies for storage.
    pub fn is_cacheable_response(&self, response: &TerminalResponse) -> bool {
        let status = response.status.as_u16();
        if !self.config.cacheable_status_codes.contains(&status) {
            return false;
        }
        // A 304 has no reconstructable representation unless a body came
        // with it; refuse bodyless ones.
        if status == 304 && response.body.is_empty() {
            return false;
        }
        if let Some(cache_control) = response
            .headers
            .get("cache-control")
            .and_then(|v| v.to_str().ok())
        {
            let lowered = cache_control.to_lowercase();
            if lowered.contains("no-cache")
                || lowered.contains("no-store")
                || lowered.contains("private")
            {
                return false;
            }
        }
        true
    }

    /// TTL precedence: explicit max-age, then the longest matching per-path
    /// strategy, then the default.
    pub fn ttl_for(&self, path: &str, response_headers: &HeaderMap) -> u64 {
        if let Some(cache_control) = response_headers
            .get("cache-control")
            .and_then(|v| v.to_str().ok())
        {
            for directive in cache_control.split(',') {
                if let Some(raw) = directive.trim().strip_prefix("max-age=") {
                    if let Ok(secs) = raw.trim().parse::<u64>() {
                        return secs;
                    }
                }
            }
        }
        self.config
            .path_ttls
            .iter()
            .filter(|rule| path.starts_with(&rule.path_prefix))
            .max_by_key(|rule| rule.path_prefix.len())
            .map(|rule| rule.ttl_secs)
            .unwrap_or(self.config.default_ttl_secs)
    }

    // ========================================================================
    // Read / write
    // ========================================================================

    pub async fn lookup(&self, key: &str) -> Option<TerminalResponse> {
        let raw = self.store.get(key).await?;
        let entry: CacheEntry = serde_json::from_str(&raw).ok()?;
        let body = BASE64.decode(entry.body_b64).ok()?;

        let mut headers = HeaderMap::new();
        for (name, value) in entry.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                headers.insert(name, value);
            }
        }
        Some(TerminalResponse {
            status: StatusCode::from_u16(entry.status).ok()?,
            headers,
            body: Bytes::from(body),
        })
    }

    pub async fn store_response(&self, key: &str, response: &TerminalResponse, ttl_secs: u64) {
        let headers = PRESERVED_HEADERS
            .iter()
            .filter_map(|name| {
                response
                    .headers
                    .get(*name)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect();
        let entry = CacheEntry {
            status: response.status.as_u16(),
            headers,
            body_b64: BASE64.encode(&response.body),
            stored_at_ms: now_epoch_ms(),
        };
        if let Ok(serialized) = serde_json::to_string(&entry) {
            self.store.set_ex(key, &serialized, ttl_secs).await;
            tracing::debug!(key = %key, ttl_secs = ttl_secs, "Cached response");
        }
    }

    // ========================================================================
    // Invalidation
    // ========================================================================

    /// Prefixes to invalidate after a successful mutating request.
    pub fn invalidation_prefixes(&self, method: &Method, path: &str) -> Vec<String> {
        self.config
            .invalidation_rules
            .iter()
            .filter(|rule| {
                path.starts_with(&rule.path_prefix)
                    && rule
                        .methods
                        .iter()
                        .any(|m| m.eq_ignore_ascii_case(method.as_str()))
            })
            .map(|rule| format!("{}{}", self.config.key_prefix, path_scope(&rule.path_prefix)))
            .collect()
    }

    pub async fn invalidate_prefix(&self, key_prefix: &str) -> usize {
        let removed = self.store.del_prefix(key_prefix).await;
        if removed > 0 {
            tracing::debug!(prefix = %key_prefix, removed = removed, "Invalidated cache entries");
        }
        removed
    }

    /// Admin invalidation by raw pattern (prefix match under the cache
    /// namespace).
    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        let full = format!("{}{}", self.config.key_prefix, pattern);
        self.store.del_prefix(&full).await
    }

    pub async fn flush(&self) -> usize {
        self.store.flush_prefix(&self.config.key_prefix).await
    }
}

/// Canonical path scope used inside keys: slashes become colons so a rule
/// prefix maps onto a key prefix.
fn path_scope(path: &str) -> String {
    path.trim_matches('/').replace('/', ":")
}
