use axum::{http::StatusCode, response::IntoResponse};
use serde_json::json;
use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Gateway error taxonomy.
///
/// Every stage of the pipeline reports failures through this enum so the
/// orchestrator can map them to HTTP responses in one place. Variants carry
/// only what the client-facing body needs; operational detail goes to the
/// log at construction sites.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Authentication required: {0}")]
    Unauthenticated(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Rate limit exceeded: {reason}")]
    RateLimited {
        reason: String,
        retry_after_secs: u64,
    },

    #[error("Circuit breaker is open for service '{service}'")]
    CircuitOpen {
        service: String,
        retry_after_secs: u64,
    },

    #[error("No healthy instance available for service '{0}'")]
    NoHealthyInstance(String),

    #[error("Upstream request timed out after {timeout_ms}ms")]
    UpstreamTimeout { service: String, timeout_ms: u64 },

    #[error("Bad gateway: {0}")]
    BadGateway(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CircuitOpen { .. } | GatewayError::NoHealthyInstance(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable error code for programmatic handling.
    pub fn error_code(&self) -> &'static str {
        match self {
            GatewayError::Unauthenticated(_) => "UNAUTHENTICATED",
            GatewayError::Forbidden(_) => "FORBIDDEN",
            GatewayError::RateLimited { .. } => "RATE_LIMITED",
            GatewayError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            GatewayError::NoHealthyInstance(_) => "NO_HEALTHY_INSTANCE",
            GatewayError::UpstreamTimeout { .. } => "UPSTREAM_TIMEOUT",
            GatewayError::BadGateway(_) => "BAD_GATEWAY",
            GatewayError::Validation(_) => "VALIDATION_ERROR",
            GatewayError::NotFound(_) => "NOT_FOUND",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Retry-After value in seconds, where the error carries one.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited {
                retry_after_secs, ..
            }
            | GatewayError::CircuitOpen {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// User-facing message without internal detail.
    pub fn user_message(&self, production: bool) -> String {
        match self {
            GatewayError::Internal(msg) if !production => format!("Internal error: {}", msg),
            GatewayError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }

    /// Log this error with a level matching its severity.
    pub fn log(&self, request_id: &str) {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(
                error = %self,
                error_code = %self.error_code(),
                request_id = %request_id,
                status = status.as_u16(),
                "Request failed"
            );
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            tracing::warn!(
                error = %self,
                error_code = %self.error_code(),
                request_id = %request_id,
                "Request rejected"
            );
        } else {
            tracing::debug!(
                error = %self,
                error_code = %self.error_code(),
                request_id = %request_id,
                "Client error"
            );
        }
    }

    /// Build the JSON error body shared by every error response.
    pub fn body(&self, request_id: &str, production: bool) -> serde_json::Value {
        let mut body = json!({
            "error": self.error_code(),
            "message": self.user_message(production),
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "requestId": request_id,
        });
        if let Some(retry_after) = self.retry_after_secs() {
            body["retryAfter"] = json!(retry_after);
        }
        body
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        // Handlers outside the pipeline have no request id of their own.
        let request_id = uuid::Uuid::new_v4().to_string();
        self.log(&request_id);

        let status = self.status_code();
        let body = self.body(&request_id, true);

        let mut response = (status, axum::Json(body)).into_response();
        if let Some(retry_after) = self.retry_after_secs() {
            if let Ok(value) = retry_after.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::Unauthenticated("x".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::RateLimited {
                reason: "x".into(),
                retry_after_secs: 1
            }
            .status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::CircuitOpen {
                service: "users".into(),
                retry_after_secs: 1
            }
            .status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::UpstreamTimeout {
                service: "users".into(),
                timeout_ms: 5000
            }
            .status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::BadGateway("x".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_internal_detail_suppressed_in_production() {
        let err = GatewayError::Internal("connection pool exhausted".into());
        assert_eq!(err.user_message(true), "Internal server error");
        assert!(err.user_message(false).contains("connection pool"));
    }

    #[test]
    fn test_body_carries_retry_after() {
        let err = GatewayError::CircuitOpen {
            service: "users".into(),
            retry_after_secs: 7,
        };
        let body = err.body("req-1", true);
        assert_eq!(body["retryAfter"], 7);
        assert_eq!(body["requestId"], "req-1");
        assert_eq!(body["error"], "CIRCUIT_OPEN");
    }
}
