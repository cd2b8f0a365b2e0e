// ============================================================================
// Request/Response Transformer
// ============================================================================
//
// A path-prefix-indexed rule set. Each rule is a sequence of typed
// operations over headers, query parameters or the JSON body: add, remove,
// rename, transform (named function on the current value). Body paths are
// dotted (user.address.city); intermediate objects are created as needed
// for add. Every rule whose prefix matches the request path applies, in
// configuration order.
//
// ============================================================================

use crate::config::{TransformOpConfig, TransformationConfig};
use crate::context::{RequestContext, TerminalResponse};
use crate::error::{GatewayError, GatewayResult};
use axum::http::{HeaderName, HeaderValue};
use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

static QUERY_SANITIZERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)<script[^>]*>").expect("invalid sanitizer"),
        Regex::new(r"(?i)</script>").expect("invalid sanitizer"),
        Regex::new(r"(?i)javascript:").expect("invalid sanitizer"),
        Regex::new(r"(?i)\bon[a-z]+\s*=").expect("invalid sanitizer"),
    ]
});

pub struct Transformer {
    config: TransformationConfig,
}

impl Transformer {
    pub fn new(config: TransformationConfig) -> Self {
        Self { config }
    }

    // ========================================================================
    // Request side
    // ========================================================================

    pub fn transform_request(&self, ctx: &mut RequestContext) -> GatewayResult<()> {
        if !self.config.enabled {
            return Ok(());
        }

        if self.config.sanitize_queries {
            for (_, value) in ctx.query.iter_mut() {
                *value = sanitize(value);
            }
        }

        let ops: Vec<TransformOpConfig> = self
            .config
            .rules
            .iter()
            .filter(|rule| ctx.path.starts_with(&rule.path_prefix))
            .flat_map(|rule| rule.request.iter().cloned())
            .collect();

        let mut body_changed = false;
        for op in &ops {
            match op.target.as_str() {
                "headers" => apply_header_op(ctx, op)?,
                "query" => apply_query_op(ctx, op)?,
                "body" => {
                    if let Some(body) = ctx.json_body.as_mut() {
                        apply_body_op(body, op)?;
                        body_changed = true;
                    }
                }
                other => {
                    return Err(GatewayError::Validation(format!(
                        "Unknown transform target '{}'",
                        other
                    )))
                }
            }
        }
        if body_changed {
            ctx.sync_body_from_json();
        }
        Ok(())
    }

    // ========================================================================
    // Response side
    // ========================================================================

    pub fn transform_response(
        &self,
        ctx: &RequestContext,
        response: &mut TerminalResponse,
    ) -> GatewayResult<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let ops: Vec<TransformOpConfig> = self
            .config
            .rules
            .iter()
            .filter(|rule| ctx.path.starts_with(&rule.path_prefix))
            .flat_map(|rule| rule.response.iter().cloned())
            .collect();

        let is_json = response
            .headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("application/json"))
            .unwrap_or(false);
        let mut body: Option<Value> = if is_json && !response.body.is_empty() {
            serde_json::from_slice(&response.body).ok()
        } else {
            None
        };

        for op in &ops {
            match op.target.as_str() {
                "headers" => apply_response_header_op(response, op)?,
                "body" => {
                    if let Some(body) = body.as_mut() {
                        apply_body_op(body, op)?;
                    }
                }
                _ => {}
            }
        }

        if self.config.attach_metadata {
            if let Some(Value::Object(map)) = body.as_mut() {
                map.insert(
                    "_gateway".to_string(),
                    json!({
                        "timestamp": ctx.started_at.to_rfc3339(),
                        "requestId": ctx.request_id,
                        "service": ctx.service,
                        "instance": ctx.instance,
                    }),
                );
            }
        }

        if response.status.as_u16() >= 400 {
            if let Some(Value::Object(map)) = body.as_mut() {
                map.entry("_support".to_string()).or_insert_with(|| {
                    json!({
                        "requestId": ctx.request_id,
                        "timestamp": chrono::Utc::now().to_rfc3339(),
                    })
                });
            }
        }

        if let Some(body) = body {
            let serialized = serde_json::to_vec(&body)
                .map_err(|e| GatewayError::Internal(format!("Response serialization: {}", e)))?;
            response.headers.remove("content-length");
            response.body = Bytes::from(serialized);
        }
        Ok(())
    }
}

fn sanitize(value: &str) -> String {
    let mut out = value.to_string();
    for pattern in QUERY_SANITIZERS.iter() {
        out = pattern.replace_all(&out, "").into_owned();
    }
    out
}

fn apply_header_op(ctx: &mut RequestContext, op: &TransformOpConfig) -> GatewayResult<()> {
    let name = HeaderName::from_bytes(op.path.to_lowercase().as_bytes())
        .map_err(|_| GatewayError::Validation(format!("Invalid header name '{}'", op.path)))?;
    match op.action.as_str() {
        "add" => {
            let value = op
                .value
                .as_ref()
                .and_then(value_as_string)
                .unwrap_or_default();
            let value = HeaderValue::from_str(&value)
                .map_err(|_| GatewayError::Validation("Invalid header value".to_string()))?;
            ctx.headers.insert(name, value);
        }
        "remove" => {
            ctx.headers.remove(&name);
        }
        "rename" => {
            if let Some(value) = ctx.headers.remove(&name) {
                let new_name = op
                    .value
                    .as_ref()
                    .and_then(value_as_string)
                    .unwrap_or_default();
                let new_name = HeaderName::from_bytes(new_name.to_lowercase().as_bytes())
                    .map_err(|_| {
                        GatewayError::Validation("Invalid header rename target".to_string())
                    })?;
                ctx.headers.insert(new_name, value);
            }
        }
        "transform" => {
            if let Some(current) = ctx.headers.get(&name).and_then(|v| v.to_str().ok()) {
                let transformed =
                    apply_function(op.function.as_deref(), &Value::String(current.to_string()))?;
                if let Some(text) = value_as_string(&transformed) {
                    if let Ok(value) = HeaderValue::from_str(&text) {
                        ctx.headers.insert(name, value);
                    }
                }
            }
        }
        other => {
            return Err(GatewayError::Validation(format!(
                "Unknown transform action '{}'",
                other
            )))
        }
    }
    Ok(())
}

fn apply_response_header_op(
    response: &mut TerminalResponse,
    op: &TransformOpConfig,
) -> GatewayResult<()> {
    let name = HeaderName::from_bytes(op.path.to_lowercase().as_bytes())
        .map_err(|_| GatewayError::Validation(format!("Invalid header name '{}'", op.path)))?;
    match op.action.as_str() {
        "add" => {
            let value = op
                .value
                .as_ref()
                .and_then(value_as_string)
                .unwrap_or_default();
            if let Ok(value) = HeaderValue::from_str(&value) {
                response.headers.insert(name, value);
            }
        }
        "remove" => {
            response.headers.remove(&name);
        }
        _ => {}
    }
    Ok(())
}

fn apply_query_op(ctx: &mut RequestContext, op: &TransformOpConfig) -> GatewayResult<()> {
    match op.action.as_str() {
        "add" => {
            let value = op
                .value
                .as_ref()
                .and_then(value_as_string)
                .unwrap_or_default();
            ctx.query.push((op.path.clone(), value));
        }
        "remove" => {
            ctx.query.retain(|(k, _)| k != &op.path);
        }
        "rename" => {
            let new_name = op
                .value
                .as_ref()
                .and_then(value_as_string)
                .unwrap_or_default();
            for (k, _) in ctx.query.iter_mut() {
                if k == &op.path {
                    *k = new_name.clone();
                }
            }
        }
        "transform" => {
            for (k, v) in ctx.query.iter_mut() {
                if k == &op.path {
                    let transformed =
                        apply_function(op.function.as_deref(), &Value::String(v.clone()))?;
                    if let Some(text) = value_as_string(&transformed) {
                        *v = text;
                    }
                }
            }
        }
        other => {
            return Err(GatewayError::Validation(format!(
                "Unknown transform action '{}'",
                other
            )))
        }
    }
    Ok(())
}

fn apply_body_op(body: &mut Value, op: &TransformOpConfig) -> GatewayResult<()> {
    let segments: Vec<&str> = op.path.split('.').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Err(GatewayError::Validation("Empty body path".to_string()));
    }
    match op.action.as_str() {
        "add" => {
            let value = op.value.clone().unwrap_or(Value::Null);
            set_path(body, &segments, value);
        }
        "remove" => {
            remove_path(body, &segments);
        }
        "rename" => {
            if let Some(value) = take_path(body, &segments) {
                let new_path = op
                    .value
                    .as_ref()
                    .and_then(value_as_string)
                    .unwrap_or_default();
                let new_segments: Vec<&str> =
                    new_path.split('.').filter(|s| !s.is_empty()).collect();
                if !new_segments.is_empty() {
                    set_path(body, &new_segments, value);
                }
            }
        }
        "transform" => {
            if let Some(current) = get_path(body, &segments) {
                let transformed = apply_function(op.function.as_deref(), &current)?;
                set_path(body, &segments, transformed);
            }
        }
        other => {
            return Err(GatewayError::Validation(format!(
                "Unknown transform action '{}'",
                other
            )))
        }
    }
    Ok(())
}

fn get_path(body: &Value, segments: &[&str]) -> Option<Value> {
    let mut current = body;
    for segment in segments {
        current = current.get(segment)?;
    }
    Some(current.clone())
}

/// Set a dotted path, creating intermediate objects as needed.
fn set_path(body: &mut Value, segments: &[&str], value: Value) {
    let mut current = body;
    for segment in &segments[..segments.len() - 1] {
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        current = current
            .as_object_mut()
            .expect("just coerced to object")
            .entry(segment.to_string())
            .or_insert(Value::Object(serde_json::Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(serde_json::Map::new());
    }
    if let Some(map) = current.as_object_mut() {
        map.insert(segments[segments.len() - 1].to_string(), value);
    }
}

fn remove_path(body: &mut Value, segments: &[&str]) {
    let mut current = body;
    for segment in &segments[..segments.len() - 1] {
        match current.get_mut(segment) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Some(map) = current.as_object_mut() {
        map.remove(segments[segments.len() - 1]);
    }
}

fn take_path(body: &mut Value, segments: &[&str]) -> Option<Value> {
    let mut current = &mut *body;
    for segment in &segments[..segments.len() - 1] {
        current = current.get_mut(segment)?;
    }
    current
        .as_object_mut()
        .and_then(|map| map.remove(segments[segments.len() - 1]))
}

/// Named value functions for transform operations.
fn apply_function(function: Option<&str>, value: &Value) -> GatewayResult<Value> {
    let function = function.ok_or_else(|| {
        GatewayError::Validation("transform action requires a function".to_string())
    })?;
    let result = match function {
        "lowercase" => Value::String(value_as_string(value).unwrap_or_default().to_lowercase()),
        "uppercase" => Value::String(value_as_string(value).unwrap_or_default().to_uppercase()),
        "trim" => Value::String(value_as_string(value).unwrap_or_default().trim().to_string()),
        "toNumber" => {
            let text = value_as_string(value).unwrap_or_default();
            match text.parse::<f64>() {
                Ok(n) => serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                Err(_) => Value::Null,
            }
        }
        "toString" => Value::String(value_as_string(value).unwrap_or_default()),
        "toArray" => match value {
            Value::Array(_) => value.clone(),
            other => Value::Array(vec![other.clone()]),
        },
        other => {
            return Err(GatewayError::Validation(format!(
                "Unknown transform function '{}'",
                other
            )))
        }
    };
    Ok(result)
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => None,
        other => serde_json::to_string(other).ok(),
    }
}
