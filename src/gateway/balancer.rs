// ============================================================================
// Service Registry + Load Balancer
// ============================================================================
//
// Holds the configured service descriptors and per-instance runtime state:
// health, consecutive failures and live connection counts. Selection
// filters to healthy instances, then applies the service's policy.
//
// Health state is shared between the background prober and the proxy's
// passive failure reporting: both feed the same counters.
//
// ============================================================================

use crate::config::{InstanceConfig, LoadBalancingPolicy, ServiceConfig};
use crate::error::{GatewayError, GatewayResult};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

const UNHEALTHY_AFTER_FAILURES: u32 = 3;

#[derive(Clone, Copy, Debug)]
pub struct InstanceHealth {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_check: Option<Instant>,
}

pub struct Instance {
    pub config: InstanceConfig,
    health: Mutex<InstanceHealth>,
    active_connections: AtomicUsize,
}

impl Instance {
    fn new(config: InstanceConfig) -> Self {
        Self {
            config,
            health: Mutex::new(InstanceHealth {
                healthy: true,
                consecutive_failures: 0,
                last_check: None,
            }),
            active_connections: AtomicUsize::new(0),
        }
    }

    pub fn address(&self) -> String {
        self.config.address()
    }

    pub fn is_healthy(&self) -> bool {
        self.health.lock().expect("health poisoned").healthy
    }

    pub fn health(&self) -> InstanceHealth {
        *self.health.lock().expect("health poisoned")
    }

    /// Any successful probe or proxy call restores health and resets the
    /// failure counter.
    pub fn record_success(&self) {
        let mut health = self.health.lock().expect("health poisoned");
        health.consecutive_failures = 0;
        health.last_check = Some(Instant::now());
        if !health.healthy {
            health.healthy = true;
            tracing::info!(instance = %self.address(), "Instance restored to healthy");
        }
    }

    pub fn record_failure(&self) {
        let mut health = self.health.lock().expect("health poisoned");
        health.consecutive_failures += 1;
        health.last_check = Some(Instant::now());
        if health.healthy && health.consecutive_failures >= UNHEALTHY_AFTER_FAILURES {
            health.healthy = false;
            tracing::warn!(
                instance = %self.address(),
                consecutive_failures = health.consecutive_failures,
                "Instance marked unhealthy"
            );
        }
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }
}

pub struct Service {
    pub config: ServiceConfig,
    pub instances: Vec<Arc<Instance>>,
    rr_index: AtomicUsize,
    /// Instance indices expanded by integer weight, for weighted RR.
    weighted_order: Vec<usize>,
}

impl Service {
    fn new(config: ServiceConfig) -> Self {
        let instances: Vec<Arc<Instance>> = config
            .instances
            .iter()
            .map(|i| Arc::new(Instance::new(i.clone())))
            .collect();
        let weighted_order = config
            .instances
            .iter()
            .enumerate()
            .flat_map(|(idx, instance)| {
                std::iter::repeat(idx).take(instance.weight.max(1) as usize)
            })
            .collect();
        Self {
            config,
            instances,
            rr_index: AtomicUsize::new(0),
            weighted_order,
        }
    }

    pub fn healthy_instances(&self) -> Vec<Arc<Instance>> {
        self.instances
            .iter()
            .filter(|i| i.is_healthy())
            .cloned()
            .collect()
    }

    /// Pick an instance under the service's policy, healthy only.
    pub fn select(&self, client_ip: &str) -> GatewayResult<Arc<Instance>> {
        let healthy = self.healthy_instances();
        if healthy.is_empty() {
            return Err(GatewayError::NoHealthyInstance(self.config.name.clone()));
        }
        let selected = match self.config.policy {
            LoadBalancingPolicy::RoundRobin => {
                let idx = self.rr_index.fetch_add(1, Ordering::Relaxed);
                healthy[idx % healthy.len()].clone()
            }
            LoadBalancingPolicy::WeightedRoundRobin => {
                // Advance through the weighted expansion, skipping entries
                // whose instance is currently unhealthy.
                let mut picked = None;
                for _ in 0..self.weighted_order.len() {
                    let idx = self.rr_index.fetch_add(1, Ordering::Relaxed);
                    let instance = &self.instances[self.weighted_order[idx % self.weighted_order.len()]];
                    if instance.is_healthy() {
                        picked = Some(instance.clone());
                        break;
                    }
                }
                picked.unwrap_or_else(|| healthy[0].clone())
            }
            LoadBalancingPolicy::LeastConn => healthy
                .iter()
                .min_by_key(|i| i.active_connections())
                .expect("non-empty healthy list")
                .clone(),
            LoadBalancingPolicy::Random => {
                use rand::Rng;
                let idx = rand::thread_rng().gen_range(0..healthy.len());
                healthy[idx].clone()
            }
            LoadBalancingPolicy::IpHash => {
                let mut hasher = Sha256::new();
                hasher.update(client_ip.as_bytes());
                let digest = hasher.finalize();
                let hash = u64::from_be_bytes(digest[..8].try_into().expect("8 bytes"));
                healthy[(hash % healthy.len() as u64) as usize].clone()
            }
        };
        Ok(selected)
    }
}

pub struct ServiceRegistry {
    services: Vec<Arc<Service>>,
}

impl ServiceRegistry {
    pub fn new(configs: Vec<ServiceConfig>) -> Self {
        Self {
            services: configs
                .into_iter()
                .map(|c| Arc::new(Service::new(c)))
                .collect(),
        }
    }

    pub fn services(&self) -> &[Arc<Service>] {
        &self.services
    }

    /// Longest matching path prefix wins.
    pub fn find_by_path(&self, path: &str) -> Option<Arc<Service>> {
        self.services
            .iter()
            .filter(|s| path.starts_with(&s.config.path_prefix))
            .max_by_key(|s| s.config.path_prefix.len())
            .cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<Service>> {
        self.services
            .iter()
            .find(|s| s.config.name == name)
            .cloned()
    }

    /// Health map for the /health endpoint.
    pub fn health_snapshot(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for service in &self.services {
            let instances: Vec<serde_json::Value> = service
                .instances
                .iter()
                .map(|instance| {
                    let health = instance.health();
                    serde_json::json!({
                        "address": instance.address(),
                        "healthy": health.healthy,
                        "consecutiveFailures": health.consecutive_failures,
                        "activeConnections": instance.active_connections(),
                    })
                })
                .collect();
            let healthy_count = service.instances.iter().filter(|i| i.is_healthy()).count();
            map.insert(
                service.config.name.clone(),
                serde_json::json!({
                    "healthy": healthy_count > 0,
                    "healthyInstances": healthy_count,
                    "instances": instances,
                }),
            );
        }
        serde_json::Value::Object(map)
    }
}
