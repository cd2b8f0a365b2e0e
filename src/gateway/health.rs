// ============================================================================
// Health Checker
// ============================================================================
//
// One supervised loop per service probes every instance on the configured
// interval: GET <instance>/<health path> with a bounded timeout, any status
// below 500 passes. Results feed the same per-instance counters the proxy
// reports into, so active and passive health share state.
//
// ============================================================================

use crate::gateway::balancer::{Service, ServiceRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub struct HealthChecker {
    client: reqwest::Client,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    /// Spawn one probe loop per service; loops exit on the shutdown signal.
    pub fn spawn_all(
        &self,
        registry: &ServiceRegistry,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        registry
            .services()
            .iter()
            .map(|service| {
                let service = service.clone();
                let client = self.client.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let interval = Duration::from_millis(service.config.health_check.interval_ms);
                    let mut ticker = tokio::time::interval(interval);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    loop {
                        tokio::select! {
                            _ = ticker.tick() => {
                                probe_service(&client, &service).await;
                            }
                            _ = shutdown.changed() => {
                                tracing::debug!(
                                    service = %service.config.name,
                                    "Health checker stopping"
                                );
                                break;
                            }
                        }
                    }
                })
            })
            .collect()
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

async fn probe_service(client: &reqwest::Client, service: &Arc<Service>) {
    let timeout = Duration::from_millis(service.config.health_check.timeout_ms);
    for instance in &service.instances {
        let url = format!(
            "{}{}",
            instance.config.base_url(),
            service.config.health_check.path
        );
        let passed = match client.get(&url).timeout(timeout).send().await {
            Ok(response) => response.status().as_u16() < 500,
            Err(e) => {
                tracing::debug!(
                    service = %service.config.name,
                    instance = %instance.address(),
                    error = %e,
                    "Health probe failed"
                );
                false
            }
        };
        if passed {
            instance.record_success();
        } else {
            instance.record_failure();
        }
    }
}
