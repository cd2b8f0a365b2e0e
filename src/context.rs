// ============================================================================
// Request Context
// ============================================================================
//
// One RequestContext is created per incoming request and threaded mutably
// through every pipeline stage. The orchestrator owns it exclusively;
// stages borrow it for the duration of their run() call.
//
// ============================================================================

use crate::auth::Principal;
use crate::error::GatewayError;
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Instant;

/// Outcome of a single pipeline stage.
pub enum Outcome {
    /// Proceed to the next stage.
    Continue,
    /// A stage produced the final response; later mutating stages are
    /// skipped but observability hooks still fire.
    Terminal(TerminalResponse),
    /// The stage failed; the orchestrator maps the error to a response.
    Fail(GatewayError),
}

/// A fully-formed response produced inside the pipeline.
#[derive(Clone, Debug)]
pub struct TerminalResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TerminalResponse {
    pub fn new(status: StatusCode, body: Bytes) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body,
        }
    }

    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            axum::http::HeaderValue::from_static("application/json"),
        );
        Self {
            status,
            headers,
            body: Bytes::from(serde_json::to_vec(value).unwrap_or_default()),
        }
    }
}

/// Where the cache lookup landed for this request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStatus {
    /// Lookup not attempted (uncacheable method, sensitive headers, ...).
    Bypass,
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Bypass => "BYPASS",
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }
}

/// Rate-limit accounting sampled when the limiter admitted the request.
#[derive(Clone, Copy, Debug)]
pub struct QuotaSnapshot {
    pub limit: u32,
    pub remaining: u32,
    /// Epoch seconds when the current window resets.
    pub reset_epoch_secs: u64,
}

/// Per-request state threaded through the pipeline.
pub struct RequestContext {
    pub request_id: String,
    pub received_at: Instant,
    pub started_at: DateTime<Utc>,
    pub client_ip: String,
    pub method: Method,
    pub path: String,
    /// Raw query pairs in arrival order; values are not decoded.
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Parsed JSON body when the content type warrants it.
    pub json_body: Option<serde_json::Value>,

    /// Filled by the router.
    pub service: Option<String>,
    pub instance: Option<String>,
    /// Filled by the auth verifier.
    pub principal: Option<Principal>,

    // Decision records
    pub cache_status: CacheStatus,
    pub cache_key: Option<String>,
    pub quota: Option<QuotaSnapshot>,
    /// Circuit key this request was gated on; set only when admitted in
    /// half-open so the permit can be released if the proxy never runs.
    pub circuit_service: Option<String>,
    pub circuit_probe_pending: bool,

    /// Response from the upstream proxy, before response transformation.
    pub upstream_response: Option<TerminalResponse>,
    /// Terminal response produced by any stage.
    pub terminal: Option<TerminalResponse>,
    pub error: Option<GatewayError>,

    /// Free-form attributes plugins may attach via context patches.
    pub attributes: HashMap<String, serde_json::Value>,
    /// Stage name -> elapsed microseconds, recorded by the orchestrator.
    pub stage_timings: Vec<(&'static str, u128)>,
}

impl RequestContext {
    pub fn new(
        client_ip: String,
        method: Method,
        path: String,
        query: Vec<(String, String)>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Self {
        let json_body = parse_json_body(&headers, &body);
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            received_at: Instant::now(),
            started_at: Utc::now(),
            client_ip,
            method,
            path,
            query,
            headers,
            body,
            json_body,
            service: None,
            instance: None,
            principal: None,
            cache_status: CacheStatus::Bypass,
            cache_key: None,
            quota: None,
            circuit_service: None,
            circuit_probe_pending: false,
            upstream_response: None,
            terminal: None,
            error: None,
            attributes: HashMap::new(),
            stage_timings: Vec::new(),
        }
    }

    /// True once a stage has produced the final response.
    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    pub fn set_terminal(&mut self, response: TerminalResponse) {
        if self.terminal.is_none() {
            self.terminal = Some(response);
        }
    }

    /// The query string with pairs sorted by key, used for cache keying so
    /// `?a=1&b=2` and `?b=2&a=1` share an entry.
    pub fn sorted_query(&self) -> String {
        let mut pairs: Vec<&(String, String)> = self.query.iter().collect();
        pairs.sort();
        pairs
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{}={}", k, v)
                }
            })
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Rebuild the raw query string from the (possibly transformed) pairs.
    pub fn query_string(&self) -> String {
        self.query
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{}={}", k, v)
                }
            })
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Serialize the JSON body back into bytes after transformation.
    pub fn sync_body_from_json(&mut self) {
        if let Some(value) = &self.json_body {
            if let Ok(serialized) = serde_json::to_vec(value) {
                self.body = Bytes::from(serialized);
            }
        }
    }
}

/// Split a raw query string into pairs without decoding.
pub fn parse_query(raw: Option<&str>) -> Vec<(String, String)> {
    match raw {
        Some(raw) if !raw.is_empty() => raw
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (pair.to_string(), String::new()),
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_json_body(headers: &HeaderMap, body: &Bytes) -> Option<serde_json::Value> {
    if body.is_empty() {
        return None;
    }
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with("application/json") {
        return None;
    }
    serde_json::from_slice(body).ok()
}
