// ============================================================================
// Circuit Breaker
// ============================================================================
//
// Per-service three-state machine guarding the upstream call.
//
// - Closed -> Open when failures >= error_count AND the failure share of
//   all outcomes since the last transition reaches error_threshold percent
// - Open -> HalfOpen lazily, on the first request arriving at or after
//   last_state_change + reset_timeout
// - HalfOpen admits at most half_open_requests concurrent probes; that many
//   consecutive successes close the circuit, any failure reopens it
//
// The outer map is read-dominated; each circuit mutates under its own
// lock. A single request touches at most one circuit.
//
// ============================================================================

use crate::config::CircuitBreakerConfig;
use crate::error::{GatewayError, GatewayResult};
use axum::http::HeaderMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

struct CircuitInner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    half_open_successes: u32,
    half_open_in_flight: u32,
    last_state_change: Instant,
    timeouts: u64,
    opened_total: u64,
}

impl CircuitInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            half_open_successes: 0,
            half_open_in_flight: 0,
            last_state_change: Instant::now(),
            timeouts: 0,
            opened_total: 0,
        }
    }

    fn transition(&mut self, service: &str, to: CircuitState) {
        // Record the true previous state, not the target.
        let from = self.state;
        self.state = to;
        self.last_state_change = Instant::now();
        if to == CircuitState::Open {
            self.opened_total += 1;
        }
        tracing::info!(
            service = %service,
            from = %from,
            to = %to,
            failures = self.failures,
            successes = self.successes,
            "Circuit breaker state change"
        );
    }
}

struct Circuit {
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitStats {
    pub service: String,
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
    pub timeouts: u64,
    pub opened_total: u64,
    pub seconds_in_state: u64,
}

/// Per-service circuit breakers, created on first use.
pub struct CircuitBreakerRegistry {
    circuits: RwLock<HashMap<String, Arc<Circuit>>>,
    config_for: Box<dyn Fn(&str) -> CircuitBreakerConfig + Send + Sync>,
}

impl CircuitBreakerRegistry {
    pub fn new<F>(config_for: F) -> Self
    where
        F: Fn(&str) -> CircuitBreakerConfig + Send + Sync + 'static,
    {
        Self {
            circuits: RwLock::new(HashMap::new()),
            config_for: Box::new(config_for),
        }
    }

    fn circuit(&self, service: &str) -> Arc<Circuit> {
        {
            let circuits = self.circuits.read().expect("circuit map poisoned");
            if let Some(circuit) = circuits.get(service) {
                return circuit.clone();
            }
        }
        let mut circuits = self.circuits.write().expect("circuit map poisoned");
        circuits
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(Circuit {
                    config: (self.config_for)(service),
                    inner: Mutex::new(CircuitInner::new()),
                })
            })
            .clone()
    }

    /// Per-upstream-call timeout configured for this service's circuit.
    pub fn upstream_timeout(&self, service: &str) -> Duration {
        Duration::from_millis(self.circuit(service).config.timeout_ms)
    }

    /// Gate a request. In half-open this claims a probe permit which must
    /// be returned through record_success/record_failure/release_probe.
    pub fn try_acquire(&self, service: &str) -> GatewayResult<()> {
        let circuit = self.circuit(service);
        let mut inner = circuit.inner.lock().expect("circuit poisoned");

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let reset = Duration::from_millis(circuit.config.reset_timeout_ms);
                let elapsed = inner.last_state_change.elapsed();
                if elapsed >= reset {
                    inner.transition(service, CircuitState::HalfOpen);
                    inner.half_open_successes = 0;
                    inner.half_open_in_flight = 1;
                    Ok(())
                } else {
                    let remaining = reset - elapsed;
                    Err(GatewayError::CircuitOpen {
                        service: service.to_string(),
                        retry_after_secs: remaining.as_secs().max(1),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < circuit.config.half_open_requests {
                    inner.half_open_in_flight += 1;
                    Ok(())
                } else {
                    Err(GatewayError::CircuitOpen {
                        service: service.to_string(),
                        retry_after_secs: 1,
                    })
                }
            }
        }
    }

    pub fn record_success(&self, service: &str) {
        let circuit = self.circuit(service);
        let mut inner = circuit.inner.lock().expect("circuit poisoned");
        match inner.state {
            CircuitState::Closed => {
                inner.successes += 1;
            }
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= circuit.config.half_open_requests {
                    inner.transition(service, CircuitState::Closed);
                    inner.failures = 0;
                    inner.successes = 0;
                    inner.half_open_successes = 0;
                    inner.half_open_in_flight = 0;
                }
            }
            // A call admitted before the transition finished late; ignore.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, service: &str, was_timeout: bool) {
        let circuit = self.circuit(service);
        let mut inner = circuit.inner.lock().expect("circuit poisoned");
        if was_timeout {
            inner.timeouts += 1;
        }
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                let total = inner.failures + inner.successes;
                let percentage = inner.failures as u64 * 100 / total.max(1) as u64;
                if inner.failures >= circuit.config.error_count
                    && percentage >= circuit.config.error_threshold as u64
                {
                    inner.transition(service, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.half_open_successes = 0;
                inner.transition(service, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Return a half-open probe permit when the upstream call never ran
    /// (e.g. no healthy instance after the gate admitted the request).
    pub fn release_probe(&self, service: &str) {
        let circuit = self.circuit(service);
        let mut inner = circuit.inner.lock().expect("circuit poisoned");
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    pub fn state(&self, service: &str) -> CircuitState {
        let circuits = self.circuits.read().expect("circuit map poisoned");
        circuits
            .get(service)
            .map(|c| c.inner.lock().expect("circuit poisoned").state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn stats(&self) -> Vec<CircuitStats> {
        let circuits = self.circuits.read().expect("circuit map poisoned");
        circuits
            .iter()
            .map(|(service, circuit)| {
                let inner = circuit.inner.lock().expect("circuit poisoned");
                CircuitStats {
                    service: service.clone(),
                    state: inner.state,
                    failures: inner.failures,
                    successes: inner.successes,
                    timeouts: inner.timeouts,
                    opened_total: inner.opened_total,
                    seconds_in_state: inner.last_state_change.elapsed().as_secs(),
                }
            })
            .collect()
    }

    /// Manually close a circuit (admin surface).
    pub fn reset(&self, service: &str) -> bool {
        let circuits = self.circuits.read().expect("circuit map poisoned");
        match circuits.get(service) {
            Some(circuit) => {
                let mut inner = circuit.inner.lock().expect("circuit poisoned");
                inner.transition(service, CircuitState::Closed);
                inner.failures = 0;
                inner.successes = 0;
                inner.half_open_successes = 0;
                inner.half_open_in_flight = 0;
                true
            }
            None => false,
        }
    }
}

/// The circuit key for a request: the second path segment of /api/<svc>/...
/// or the x-service-name header. Neither present means the breaker is
/// bypassed.
pub fn service_key(path: &str, headers: &HeaderMap) -> Option<String> {
    let mut segments = path.trim_start_matches('/').split('/');
    if segments.next() == Some("api") {
        if let Some(service) = segments.next() {
            if !service.is_empty() {
                return Some(service.to_string());
            }
        }
    }
    headers
        .get("x-service-name")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(config: CircuitBreakerConfig) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(move |_| config.clone())
    }

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            timeout_ms: 1000,
            error_count: 3,
            error_threshold: 50,
            reset_timeout_ms: 100,
            half_open_requests: 3,
        }
    }

    fn open_circuit(registry: &CircuitBreakerRegistry, service: &str) {
        for _ in 0..3 {
            registry.try_acquire(service).unwrap();
            registry.record_failure(service, false);
        }
        assert_eq!(registry.state(service), CircuitState::Open);
    }

    #[test]
    fn test_starts_closed_and_admits() {
        let registry = registry(fast_config());
        assert!(registry.try_acquire("users").is_ok());
        assert_eq!(registry.state("users"), CircuitState::Closed);
    }

    #[test]
    fn test_opens_after_error_count_reached() {
        let registry = registry(fast_config());
        registry.record_failure("users", false);
        registry.record_failure("users", false);
        assert_eq!(registry.state("users"), CircuitState::Closed);
        registry.record_failure("users", false);
        assert_eq!(registry.state("users"), CircuitState::Open);
    }

    #[test]
    fn test_error_threshold_percentage_gates_opening() {
        // 3 failures against 7 successes = 30%, below the 50% threshold
        let registry = registry(fast_config());
        for _ in 0..7 {
            registry.record_success("users");
        }
        for _ in 0..3 {
            registry.record_failure("users", false);
        }
        assert_eq!(registry.state("users"), CircuitState::Closed);
        // More failures push the share over 50%
        for _ in 0..8 {
            registry.record_failure("users", false);
        }
        assert_eq!(registry.state("users"), CircuitState::Open);
    }

    #[test]
    fn test_open_rejects_with_retry_after() {
        let mut config = fast_config();
        config.reset_timeout_ms = 60_000;
        let registry = registry(config);
        open_circuit(&registry, "users");

        match registry.try_acquire("users") {
            Err(GatewayError::CircuitOpen {
                retry_after_secs, ..
            }) => {
                assert!(retry_after_secs >= 1 && retry_after_secs <= 60);
            }
            other => panic!("expected CircuitOpen, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_open_remains_open_until_reset_timeout() {
        let registry = registry(fast_config());
        open_circuit(&registry, "users");
        // Immediately: still open
        assert!(registry.try_acquire("users").is_err());
        assert_eq!(registry.state("users"), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(150));
        // First request at/after the deadline transitions to half-open
        assert!(registry.try_acquire("users").is_ok());
        assert_eq!(registry.state("users"), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_limits_concurrent_probes() {
        let registry = registry(fast_config());
        open_circuit(&registry, "users");
        std::thread::sleep(Duration::from_millis(150));

        // First acquire transitions and takes a permit; two more fit
        assert!(registry.try_acquire("users").is_ok());
        assert!(registry.try_acquire("users").is_ok());
        assert!(registry.try_acquire("users").is_ok());
        // Fourth concurrent probe is rejected
        assert!(registry.try_acquire("users").is_err());

        // Completing one probe frees a permit
        registry.record_success("users");
        assert!(registry.try_acquire("users").is_ok());
    }

    #[test]
    fn test_half_open_closes_after_consecutive_successes() {
        let registry = registry(fast_config());
        open_circuit(&registry, "users");
        std::thread::sleep(Duration::from_millis(150));

        for _ in 0..3 {
            registry.try_acquire("users").unwrap();
            registry.record_success("users");
        }
        assert_eq!(registry.state("users"), CircuitState::Closed);
        assert!(registry.try_acquire("users").is_ok());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let registry = registry(fast_config());
        open_circuit(&registry, "users");
        std::thread::sleep(Duration::from_millis(150));

        registry.try_acquire("users").unwrap();
        registry.record_success("users");
        registry.try_acquire("users").unwrap();
        registry.record_failure("users", false);
        assert_eq!(registry.state("users"), CircuitState::Open);
        assert!(registry.try_acquire("users").is_err());
    }

    #[test]
    fn test_release_probe_returns_permit() {
        let mut config = fast_config();
        config.half_open_requests = 1;
        let registry = registry(config);
        open_circuit(&registry, "users");
        std::thread::sleep(Duration::from_millis(150));

        registry.try_acquire("users").unwrap();
        assert!(registry.try_acquire("users").is_err());
        registry.release_probe("users");
        assert!(registry.try_acquire("users").is_ok());
    }

    #[test]
    fn test_timeout_failures_counted_separately() {
        let registry = registry(fast_config());
        registry.record_failure("users", true);
        registry.record_failure("users", false);
        let stats = registry.stats();
        let users = stats.iter().find(|s| s.service == "users").unwrap();
        assert_eq!(users.timeouts, 1);
        assert_eq!(users.failures, 2);
    }

    #[test]
    fn test_circuits_are_per_service() {
        let registry = registry(fast_config());
        open_circuit(&registry, "users");
        assert_eq!(registry.state("orders"), CircuitState::Closed);
        assert!(registry.try_acquire("orders").is_ok());
    }

    #[test]
    fn test_admin_reset_closes() {
        let registry = registry(fast_config());
        open_circuit(&registry, "users");
        assert!(registry.reset("users"));
        assert_eq!(registry.state("users"), CircuitState::Closed);
        assert!(!registry.reset("never-seen"));
    }

    #[test]
    fn test_service_key_derivation() {
        let headers = HeaderMap::new();
        assert_eq!(
            service_key("/api/users/42", &headers).as_deref(),
            Some("users")
        );
        assert_eq!(service_key("/health", &headers), None);

        let mut headers = HeaderMap::new();
        headers.insert("x-service-name", "billing".parse().unwrap());
        assert_eq!(
            service_key("/anything", &headers).as_deref(),
            Some("billing")
        );
    }
}
