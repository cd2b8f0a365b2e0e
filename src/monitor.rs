// ============================================================================
// Monitoring
// ============================================================================
//
// In-memory counters and bounded rings backing the /metrics snapshot:
// per-method, per-path and per-status counters, the last 1000 response
// times, the last 100 resource samples, the last 100 alerts. Rings evict
// oldest first; nothing here persists across restarts.
//
// ============================================================================

use crate::config::MonitoringConfig;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

const RESPONSE_TIME_CAPACITY: usize = 1000;
const RESOURCE_SAMPLE_CAPACITY: usize = 100;
const ALERT_CAPACITY: usize = 100;

#[derive(Clone, Debug)]
pub struct Alert {
    pub severity: &'static str,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct Counters {
    total: u64,
    errors: u64,
    by_method: HashMap<String, u64>,
    by_path: HashMap<String, u64>,
    by_status: HashMap<u16, u64>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ResourceSample {
    pub cpu_load: f64,
    pub memory_mb: f64,
}

pub struct Monitor {
    config: MonitoringConfig,
    started_at: Instant,
    counters: Mutex<Counters>,
    response_times_ms: Mutex<VecDeque<u64>>,
    resource_samples: Mutex<VecDeque<ResourceSample>>,
    alerts: Mutex<VecDeque<Alert>>,
}

impl Monitor {
    pub fn new(config: MonitoringConfig) -> Self {
        Self {
            config,
            started_at: Instant::now(),
            counters: Mutex::new(Counters::default()),
            response_times_ms: Mutex::new(VecDeque::with_capacity(RESPONSE_TIME_CAPACITY)),
            resource_samples: Mutex::new(VecDeque::with_capacity(RESOURCE_SAMPLE_CAPACITY)),
            alerts: Mutex::new(VecDeque::with_capacity(ALERT_CAPACITY)),
        }
    }

    pub fn record(&self, method: &str, path: &str, status: u16, elapsed_ms: u64) {
        if !self.config.enabled {
            return;
        }
        {
            let mut counters = self.counters.lock().expect("counters poisoned");
            counters.total += 1;
            if status >= 500 {
                counters.errors += 1;
            }
            *counters.by_method.entry(method.to_string()).or_default() += 1;
            *counters.by_path.entry(path.to_string()).or_default() += 1;
            *counters.by_status.entry(status).or_default() += 1;
        }
        {
            let mut times = self.response_times_ms.lock().expect("ring poisoned");
            if times.len() == RESPONSE_TIME_CAPACITY {
                times.pop_front();
            }
            times.push_back(elapsed_ms);
        }
        if elapsed_ms > self.config.alert_response_time_ms {
            self.push_alert(
                "warning",
                format!(
                    "Slow response: {} {} took {}ms (status {})",
                    method, path, elapsed_ms, status
                ),
            );
        }
    }

    pub fn push_alert(&self, severity: &'static str, message: String) {
        let mut alerts = self.alerts.lock().expect("alerts poisoned");
        if alerts.len() == ALERT_CAPACITY {
            alerts.pop_front();
        }
        alerts.push_back(Alert {
            severity,
            message,
            timestamp: Utc::now(),
        });
    }

    pub fn record_resources(&self, sample: ResourceSample) {
        let mut samples = self.resource_samples.lock().expect("samples poisoned");
        if samples.len() == RESOURCE_SAMPLE_CAPACITY {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// The /metrics snapshot.
    pub fn snapshot(&self) -> serde_json::Value {
        let counters = self.counters.lock().expect("counters poisoned");
        let times = self.response_times_ms.lock().expect("ring poisoned");
        let samples = self.resource_samples.lock().expect("samples poisoned");
        let alerts = self.alerts.lock().expect("alerts poisoned");

        let avg_ms = if times.is_empty() {
            0.0
        } else {
            times.iter().sum::<u64>() as f64 / times.len() as f64
        };
        let max_ms = times.iter().max().copied().unwrap_or(0);
        let error_rate = if counters.total == 0 {
            0.0
        } else {
            counters.errors as f64 / counters.total as f64
        };

        json!({
            "uptime": self.uptime_secs(),
            "requests": {
                "total": counters.total,
                "errors": counters.errors,
                "errorRate": error_rate,
                "byMethod": counters.by_method,
                "byPath": counters.by_path,
                "byStatus": counters
                    .by_status
                    .iter()
                    .map(|(k, v)| (k.to_string(), *v))
                    .collect::<HashMap<String, u64>>(),
            },
            "responseTimes": {
                "samples": times.len(),
                "averageMs": avg_ms,
                "maxMs": max_ms,
            },
            "resources": {
                "samples": samples.len(),
                "cpuLoad": samples.back().map(|s| s.cpu_load).unwrap_or(0.0),
                "memoryMb": samples.back().map(|s| s.memory_mb).unwrap_or(0.0),
            },
            "alerts": alerts
                .iter()
                .map(|a| json!({
                    "severity": a.severity,
                    "message": a.message,
                    "timestamp": a.timestamp.to_rfc3339(),
                }))
                .collect::<Vec<_>>(),
        })
    }
}

/// Best-effort process resource sample. Values default to zero on
/// platforms without procfs.
pub fn sample_resources() -> ResourceSample {
    #[cfg(target_os = "linux")]
    {
        let cpu_load = std::fs::read_to_string("/proc/loadavg")
            .ok()
            .and_then(|s| {
                s.split_whitespace()
                    .next()
                    .and_then(|v| v.parse::<f64>().ok())
            })
            .unwrap_or(0.0);
        let memory_mb = std::fs::read_to_string("/proc/self/statm")
            .ok()
            .and_then(|s| {
                s.split_whitespace()
                    .nth(1)
                    .and_then(|v| v.parse::<f64>().ok())
            })
            .map(|pages| pages * 4096.0 / (1024.0 * 1024.0))
            .unwrap_or(0.0);
        ResourceSample {
            cpu_load,
            memory_mb,
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        ResourceSample::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> Monitor {
        Monitor::new(MonitoringConfig::default())
    }

    #[test]
    fn test_counters_accumulate() {
        let monitor = monitor();
        monitor.record("GET", "/api/users", 200, 12);
        monitor.record("GET", "/api/users", 200, 8);
        monitor.record("POST", "/api/users", 500, 40);

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot["requests"]["total"], 3);
        assert_eq!(snapshot["requests"]["errors"], 1);
        assert_eq!(snapshot["requests"]["byMethod"]["GET"], 2);
        assert_eq!(snapshot["requests"]["byStatus"]["500"], 1);
    }

    #[test]
    fn test_response_time_ring_bounded() {
        let monitor = monitor();
        for i in 0..1100u64 {
            monitor.record("GET", "/x", 200, i);
        }
        let snapshot = monitor.snapshot();
        assert_eq!(snapshot["responseTimes"]["samples"], 1000);
        // Oldest evicted: max survives, early values are gone
        assert_eq!(snapshot["responseTimes"]["maxMs"], 1099);
    }

    #[test]
    fn test_slow_request_raises_alert() {
        let config = MonitoringConfig {
            alert_response_time_ms: 100,
            ..MonitoringConfig::default()
        };
        let monitor = Monitor::new(config);
        monitor.record("GET", "/slow", 200, 250);
        let snapshot = monitor.snapshot();
        let alerts = snapshot["alerts"].as_array().unwrap();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0]["message"].as_str().unwrap().contains("/slow"));
    }

    #[test]
    fn test_alert_ring_bounded() {
        let monitor = monitor();
        for i in 0..150 {
            monitor.push_alert("info", format!("alert-{}", i));
        }
        let snapshot = monitor.snapshot();
        let alerts = snapshot["alerts"].as_array().unwrap();
        assert_eq!(alerts.len(), 100);
        assert_eq!(alerts[0]["message"], "alert-50");
    }

    #[test]
    fn test_disabled_monitor_records_nothing() {
        let monitor = Monitor::new(MonitoringConfig {
            enabled: false,
            ..MonitoringConfig::default()
        });
        monitor.record("GET", "/x", 200, 1);
        assert_eq!(monitor.snapshot()["requests"]["total"], 0);
    }
}
