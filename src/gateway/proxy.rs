// ============================================================================
// Reverse Proxy
// ============================================================================
//
// Forwards the (possibly transformed) request to the selected instance and
// rebuilds the upstream reply as a TerminalResponse. Hop-by-hop headers are
// dropped in both directions; the service's prefix is stripped when
// configured; the reply is stamped with the service and instance that
// produced it.
//
// ============================================================================

use crate::context::{RequestContext, TerminalResponse};
use crate::gateway::balancer::{Instance, Service};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Headers never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

#[derive(Debug)]
pub enum ProxyError {
    /// The upstream call exceeded its deadline.
    Timeout,
    /// Connection-level failure; counts against instance health.
    Connection(String),
}

pub struct UpstreamClient {
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .tcp_keepalive(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    /// Forward the request to one instance and collect the reply.
    pub async fn forward(
        &self,
        ctx: &RequestContext,
        service: &Arc<Service>,
        instance: &Arc<Instance>,
        timeout: Duration,
    ) -> Result<TerminalResponse, ProxyError> {
        let upstream_path = if service.config.strip_prefix {
            let stripped = ctx
                .path
                .strip_prefix(&service.config.path_prefix)
                .unwrap_or(&ctx.path);
            if stripped.is_empty() {
                "/".to_string()
            } else {
                stripped.to_string()
            }
        } else {
            ctx.path.clone()
        };

        let query = ctx.query_string();
        let url = if query.is_empty() {
            format!("{}{}", instance.config.base_url(), upstream_path)
        } else {
            format!("{}{}?{}", instance.config.base_url(), upstream_path, query)
        };

        let method = reqwest::Method::from_bytes(ctx.method.as_str().as_bytes())
            .map_err(|e| ProxyError::Connection(format!("Invalid method: {}", e)))?;
        let mut request = self.client.request(method, &url).timeout(timeout);

        for (name, value) in ctx.headers.iter() {
            if HOP_BY_HOP.contains(&name.as_str()) {
                continue;
            }
            request = request.header(name.as_str(), value.as_bytes());
        }
        if !ctx.body.is_empty() {
            request = request.body(ctx.body.clone());
        }

        let response = request.send().await.map_err(classify)?;
        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);

        let mut headers = HeaderMap::new();
        for (name, value) in response.headers().iter() {
            if HOP_BY_HOP.contains(&name.as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.insert(name, value);
            }
        }

        let body = response.bytes().await.map_err(classify)?;

        let mut terminal = TerminalResponse {
            status,
            headers,
            body: Bytes::from(body.to_vec()),
        };
        if let Ok(value) = HeaderValue::from_str(&service.config.name) {
            terminal.headers.insert("x-gateway-service", value);
        }
        if let Ok(value) = HeaderValue::from_str(&instance.address()) {
            terminal.headers.insert("x-gateway-instance", value);
        }
        Ok(terminal)
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(err: reqwest::Error) -> ProxyError {
    if err.is_timeout() {
        ProxyError::Timeout
    } else {
        ProxyError::Connection(err.to_string())
    }
}
