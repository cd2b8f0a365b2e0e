// ============================================================================
// Rate Limiter
// ============================================================================
//
// Two limits checked in order: a global fixed window keyed by client IP,
// then a per-identity quota keyed by principal or API key. Windows are
// fixed, not sliding: window_start = floor(now / window) * window, and a
// bucket is lazily re-initialized on the first touch after its window
// ends. This bounds memory to one bucket per key and avoids per-request
// cleanup work, at the cost of a 2x burst at window boundaries.
//
// Buckets live in a sharded in-memory map; a periodic sweeper drops
// buckets whose window has long ended.
//
// ============================================================================

use crate::config::{RateLimitConfig, SlowDownConfig};
use crate::utils::now_epoch_ms;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::Duration;

const SHARD_COUNT: usize = 16;

#[derive(Clone, Copy, Debug)]
struct Bucket {
    window_start_ms: u64,
    window_ms: u64,
    count: u32,
}

/// Result of counting one request against a bucket.
#[derive(Clone, Copy, Debug)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_epoch_secs: u64,
    pub retry_after_secs: u64,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    shards: Vec<Mutex<HashMap<String, Bucket>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            shards: (0..SHARD_COUNT)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, Bucket>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Count one request against the key's fixed window.
    pub fn check(&self, key: &str, limit: u32, window_ms: u64, now_ms: u64) -> Decision {
        let window_start = (now_ms / window_ms) * window_ms;
        let mut shard = self.shard(key).lock().expect("rate limit shard poisoned");
        let bucket = shard.entry(key.to_string()).or_insert(Bucket {
            window_start_ms: window_start,
            window_ms,
            count: 0,
        });

        // Lazy reset on the first touch past the window end
        if now_ms.saturating_sub(bucket.window_start_ms) >= bucket.window_ms {
            bucket.window_start_ms = window_start;
            bucket.window_ms = window_ms;
            bucket.count = 0;
        }

        bucket.count += 1;
        let reset_ms = bucket.window_start_ms + bucket.window_ms;
        Decision {
            allowed: bucket.count <= limit,
            limit,
            remaining: limit.saturating_sub(bucket.count),
            reset_epoch_secs: reset_ms / 1000,
            retry_after_secs: (reset_ms.saturating_sub(now_ms) + 999) / 1000,
        }
    }

    /// Global window keyed by client IP.
    pub fn check_global(&self, client_ip: &str, now_ms: u64) -> Decision {
        self.check(
            &format!("ip:{}", client_ip),
            self.config.max_requests,
            self.config.window_ms,
            now_ms,
        )
    }

    /// Per-identity quota; the caller supplies any API-key override.
    pub fn check_identity(
        &self,
        identity_key: &str,
        limit_override: Option<u32>,
        window_override: Option<u64>,
        now_ms: u64,
    ) -> Decision {
        self.check(
            identity_key,
            limit_override.unwrap_or(self.config.quota_max_requests),
            window_override.unwrap_or(self.config.quota_window_ms),
            now_ms,
        )
    }

    /// Deterministic delay for the slow-down policy: latency injection,
    /// never a rejection.
    pub fn slow_down_delay(&self, client_ip: &str, now_ms: u64) -> Option<Duration> {
        let slow: &SlowDownConfig = &self.config.slow_down;
        if !slow.enabled {
            return None;
        }
        let decision = self.check(
            &format!("slow:{}", client_ip),
            u32::MAX,
            slow.window_ms,
            now_ms,
        );
        let count = decision.limit.saturating_sub(decision.remaining);
        if count <= slow.delay_after {
            return None;
        }
        let over = (count - slow.delay_after) as u64;
        Some(Duration::from_millis(
            (over * slow.delay_ms).min(slow.max_delay_ms),
        ))
    }

    /// Drop buckets whose window ended more than one full window ago.
    pub fn sweep(&self) {
        let now = now_epoch_ms();
        for shard in &self.shards {
            let mut shard = shard.lock().expect("rate limit shard poisoned");
            shard.retain(|_, bucket| {
                now.saturating_sub(bucket.window_start_ms) < bucket.window_ms * 2
            });
        }
    }

    /// Tracked bucket count across all shards.
    pub fn bucket_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().expect("rate limit shard poisoned").len())
            .sum()
    }
}
