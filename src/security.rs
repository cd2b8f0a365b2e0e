// ============================================================================
// Security Filter
// ============================================================================
//
// First stage of the pipeline: IP allow/deny lists, input size caps, and
// pattern-based threat detection over query, body and headers. A non-empty
// allow list is authoritative; otherwise the deny list blocks. Repeated
// violations auto-deny the offending IP for the life of the process.
//
// ============================================================================

use crate::config::{LimitsConfig, SecurityConfig};
use crate::context::RequestContext;
use crate::error::{GatewayError, GatewayResult};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

const VIOLATION_WINDOW: Duration = Duration::from_secs(3600);

static THREAT_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        (
            "sql-injection",
            Regex::new(
                r"(?i)(\bunion\b[\s/*]+\bselect\b|\bselect\b.+\bfrom\b|\binsert\s+into\b|\bdrop\s+table\b|\bdelete\s+from\b|\bor\s+1\s*=\s*1\b)",
            )
            .expect("invalid sql pattern"),
        ),
        (
            "xss",
            Regex::new(r"(?i)(<script|javascript:|\bon[a-z]+\s*=)").expect("invalid xss pattern"),
        ),
        (
            "path-traversal",
            Regex::new(r"(?i)(\.\./|\.\.\\|%2e%2e%2f|%2e%2e/|\.\.%2f)")
                .expect("invalid traversal pattern"),
        ),
    ]
});

pub struct SecurityFilter {
    config: SecurityConfig,
    limits: LimitsConfig,
    /// IPs denied at runtime after repeated violations.
    dynamic_deny: RwLock<HashSet<String>>,
    violations: Mutex<HashMap<String, Vec<Instant>>>,
}

impl SecurityFilter {
    pub fn new(config: SecurityConfig, limits: LimitsConfig) -> Self {
        Self {
            config,
            limits,
            dynamic_deny: RwLock::new(HashSet::new()),
            violations: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, ctx: &RequestContext) -> GatewayResult<()> {
        if !self.config.enabled {
            return Ok(());
        }

        self.check_ip(&ctx.client_ip)?;
        self.check_sizes(ctx)?;

        if self.config.threat_detection_enabled {
            if let Some(pattern) = self.scan(ctx) {
                self.record_violation(&ctx.client_ip, pattern);
                return Err(GatewayError::Validation(format!(
                    "Request blocked by threat detection ({})",
                    pattern
                )));
            }
        }
        Ok(())
    }

    fn check_ip(&self, ip: &str) -> GatewayResult<()> {
        if !self.config.ip_allow_list.is_empty() {
            if self.config.ip_allow_list.iter().any(|a| a == ip) {
                return Ok(());
            }
            return Err(GatewayError::Forbidden(
                "IP address not in allow list".to_string(),
            ));
        }
        if self.config.ip_deny_list.iter().any(|d| d == ip) {
            return Err(GatewayError::Forbidden("IP address denied".to_string()));
        }
        let denied = self
            .dynamic_deny
            .read()
            .expect("deny set poisoned")
            .contains(ip);
        if denied {
            return Err(GatewayError::Forbidden(
                "IP address denied after repeated violations".to_string(),
            ));
        }
        Ok(())
    }

    fn check_sizes(&self, ctx: &RequestContext) -> GatewayResult<()> {
        for (name, value) in ctx.headers.iter() {
            if value.as_bytes().len() > self.limits.max_header_value_bytes {
                return Err(GatewayError::Validation(format!(
                    "Header '{}' exceeds the size limit",
                    name
                )));
            }
        }
        if let Some(body) = &ctx.json_body {
            self.check_value(body, 0)?;
        }
        Ok(())
    }

    fn check_value(&self, value: &serde_json::Value, depth: usize) -> GatewayResult<()> {
        if depth > self.limits.max_body_depth {
            return Err(GatewayError::Validation(
                "Request body nesting too deep".to_string(),
            ));
        }
        match value {
            serde_json::Value::String(s) if s.len() > self.limits.max_scalar_value_bytes => {
                Err(GatewayError::Validation(
                    "Request body value exceeds the size limit".to_string(),
                ))
            }
            serde_json::Value::Array(items) => {
                for item in items {
                    self.check_value(item, depth + 1)?;
                }
                Ok(())
            }
            serde_json::Value::Object(map) => {
                for item in map.values() {
                    self.check_value(item, depth + 1)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Scan query, body and headers; returns the first matching pattern name.
    /// The query is scanned both raw and percent-decoded so encoded
    /// payloads cannot slip past.
    fn scan(&self, ctx: &RequestContext) -> Option<&'static str> {
        let query = ctx.query_string();
        if let Some(name) =
            match_patterns(&query).or_else(|| match_patterns(&crate::utils::percent_decode(&query)))
        {
            return Some(name);
        }
        if let Some(body) = &ctx.json_body {
            if let Some(name) = scan_value(body) {
                return Some(name);
            }
        }
        for value in ctx.headers.values() {
            if let Ok(text) = value.to_str() {
                if let Some(name) = match_patterns(text) {
                    return Some(name);
                }
            }
        }
        None
    }

    fn record_violation(&self, ip: &str, pattern: &str) {
        let mut violations = self.violations.lock().expect("violation log poisoned");
        let now = Instant::now();
        let entries = violations.entry(ip.to_string()).or_default();
        entries.retain(|t| now.duration_since(*t) < VIOLATION_WINDOW);
        entries.push(now);
        let count = entries.len() as u32;

        tracing::warn!(
            ip = %ip,
            pattern = %pattern,
            violations_in_window = count,
            "Security violation detected"
        );

        if count > self.config.max_violations_per_hour {
            drop(violations);
            let mut deny = self.dynamic_deny.write().expect("deny set poisoned");
            if deny.insert(ip.to_string()) {
                tracing::warn!(ip = %ip, "IP auto-added to deny list");
            }
        }
    }

    /// Violations currently on record for an IP (test and metrics hook).
    pub fn violation_count(&self, ip: &str) -> usize {
        self.violations
            .lock()
            .expect("violation log poisoned")
            .get(ip)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

fn match_patterns(text: &str) -> Option<&'static str> {
    for (name, pattern) in THREAT_PATTERNS.iter() {
        if pattern.is_match(text) {
            return Some(name);
        }
    }
    None
}

fn scan_value(value: &serde_json::Value) -> Option<&'static str> {
    match value {
        serde_json::Value::String(s) => match_patterns(s),
        serde_json::Value::Array(items) => items.iter().find_map(scan_value),
        serde_json::Value::Object(map) => map.values().find_map(scan_value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::parse_query;
    use axum::http::{HeaderMap, Method};
    use bytes::Bytes;

    fn filter() -> SecurityFilter {
        SecurityFilter::new(SecurityConfig::default(), LimitsConfig::default())
    }

    fn ctx(ip: &str, query: &str, body: &str) -> RequestContext {
        let mut headers = HeaderMap::new();
        if !body.is_empty() {
            headers.insert("content-type", "application/json".parse().unwrap());
        }
        RequestContext::new(
            ip.to_string(),
            Method::GET,
            "/api/users".to_string(),
            parse_query(Some(query)),
            headers,
            Bytes::from(body.to_string()),
        )
    }

    #[test]
    fn test_clean_request_passes() {
        assert!(filter().check(&ctx("10.0.0.1", "page=2&sort=name", "")).is_ok());
    }

    #[test]
    fn test_sql_injection_in_query_blocked() {
        let err = filter()
            .check(&ctx("10.0.0.1", "q=1%20union%20select+password", ""))
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[test]
    fn test_xss_in_body_blocked() {
        let body = r#"{"comment":"<script>alert(1)</script>"}"#;
        assert!(filter().check(&ctx("10.0.0.1", "", body)).is_err());
    }

    #[test]
    fn test_path_traversal_blocked() {
        assert!(filter().check(&ctx("10.0.0.1", "file=../../etc/passwd", "")).is_err());
        assert!(filter()
            .check(&ctx("10.0.0.1", "file=%2e%2e%2fetc", ""))
            .is_err());
    }

    #[test]
    fn test_allow_list_is_authoritative() {
        let config = SecurityConfig {
            ip_allow_list: vec!["10.0.0.1".to_string()],
            ..SecurityConfig::default()
        };
        let filter = SecurityFilter::new(config, LimitsConfig::default());
        assert!(filter.check(&ctx("10.0.0.1", "", "")).is_ok());
        let err = filter.check(&ctx("10.0.0.2", "", "")).unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden(_)));
    }

    #[test]
    fn test_deny_list_blocks() {
        let config = SecurityConfig {
            ip_deny_list: vec!["10.0.0.9".to_string()],
            ..SecurityConfig::default()
        };
        let filter = SecurityFilter::new(config, LimitsConfig::default());
        assert!(filter.check(&ctx("10.0.0.9", "", "")).is_err());
        assert!(filter.check(&ctx("10.0.0.8", "", "")).is_ok());
    }

    #[test]
    fn test_deep_nesting_rejected() {
        let mut body = String::new();
        for _ in 0..12 {
            body.push_str(r#"{"a":"#);
        }
        body.push('1');
        for _ in 0..12 {
            body.push('}');
        }
        assert!(filter().check(&ctx("10.0.0.1", "", &body)).is_err());
    }

    #[test]
    fn test_oversized_scalar_rejected() {
        let big = "x".repeat(11 * 1024);
        let body = format!(r#"{{"blob":"{}"}}"#, big);
        assert!(filter().check(&ctx("10.0.0.1", "", &body)).is_err());
    }

    #[test]
    fn test_oversized_header_rejected() {
        let mut request = ctx("10.0.0.1", "", "");
        request
            .headers
            .insert("x-big", "y".repeat(9 * 1024).parse().unwrap());
        assert!(filter().check(&request).is_err());
    }

    #[test]
    fn test_repeated_violations_auto_deny() {
        let filter = filter();
        let attack = ctx("10.9.9.9", "q=<script>alert(1)</script>", "");
        for _ in 0..11 {
            let _ = filter.check(&attack);
        }
        // 11 violations within the hour: the IP is now denied outright,
        // even for clean requests.
        let clean = ctx("10.9.9.9", "", "");
        let err = filter.check(&clean).unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden(_)));
    }
}
