// ============================================================================
// Tiered Key/Value Store
// ============================================================================
//
// Primary tier is Redis (ConnectionManager, auto-reconnecting); the
// fallback is an in-process map with its own TTL index. The fallback is
// engaged whenever the Redis connection errors and the tiers are never
// synchronized with each other. A background sweeper evicts expired local
// entries; the same pass re-probes Redis so the primary tier comes back
// once the connection recovers.
//
// ============================================================================

use anyhow::Result;
use redis::{aio::ConnectionManager, AsyncCommands};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

struct LocalEntry {
    value: String,
    expires_at: Instant,
}

/// Two-tier string store: Redis when reachable, in-process map otherwise.
pub struct TieredStore {
    redis: Option<ConnectionManager>,
    redis_available: AtomicBool,
    local: RwLock<HashMap<String, LocalEntry>>,
}

impl TieredStore {
    /// Connect to Redis if a URL is configured; otherwise run local-only.
    pub async fn connect(redis_url: Option<&str>) -> Self {
        let redis = match redis_url {
            Some(url) => match Self::open(url).await {
                Ok(conn) => {
                    tracing::info!("Connected to Redis cache tier");
                    Some(conn)
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Redis unavailable at startup, using in-process cache tier"
                    );
                    None
                }
            },
            None => None,
        };
        let available = redis.is_some();
        Self {
            redis,
            redis_available: AtomicBool::new(available),
            local: RwLock::new(HashMap::new()),
        }
    }

    async fn open(url: &str) -> Result<ConnectionManager> {
        let client = redis::Client::open(url)?;
        let conn = tokio::time::timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| anyhow::anyhow!("Redis connection timed out"))??;
        Ok(conn)
    }

    fn redis_active(&self) -> Option<ConnectionManager> {
        if self.redis_available.load(Ordering::Relaxed) {
            self.redis.clone()
        } else {
            None
        }
    }

    fn mark_redis_down(&self, err: &redis::RedisError) {
        if self.redis_available.swap(false, Ordering::Relaxed) {
            tracing::warn!(
                error = %err,
                "Redis error, falling back to in-process cache tier"
            );
        }
    }

    /// Whether the external tier is currently serving requests.
    pub fn is_external_active(&self) -> bool {
        self.redis_available.load(Ordering::Relaxed)
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        if let Some(mut conn) = self.redis_active() {
            match conn.get::<_, Option<String>>(key).await {
                Ok(value) => return value,
                Err(e) => self.mark_redis_down(&e),
            }
        }
        let local = self.local.read().await;
        local.get(key).and_then(|entry| {
            if entry.expires_at > Instant::now() {
                Some(entry.value.clone())
            } else {
                None
            }
        })
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) {
        if let Some(mut conn) = self.redis_active() {
            match conn.set_ex::<_, _, ()>(key, value, ttl_secs).await {
                Ok(()) => return,
                Err(e) => self.mark_redis_down(&e),
            }
        }
        let mut local = self.local.write().await;
        local.insert(
            key.to_string(),
            LocalEntry {
                value: value.to_string(),
                expires_at: Instant::now() + Duration::from_secs(ttl_secs),
            },
        );
    }

    pub async fn del(&self, key: &str) {
        if let Some(mut conn) = self.redis_active() {
            match conn.del::<_, i64>(key).await {
                Ok(_) => return,
                Err(e) => self.mark_redis_down(&e),
            }
        }
        let mut local = self.local.write().await;
        local.remove(key);
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.get(key).await.is_some()
    }

    /// Delete every key starting with the given prefix in the active tier.
    /// Best-effort; an error simply leaves stale entries to expire on TTL.
    pub async fn del_prefix(&self, prefix: &str) -> usize {
        if let Some(mut conn) = self.redis_active() {
            match self.redis_del_prefix(&mut conn, prefix).await {
                Ok(count) => return count,
                Err(e) => self.mark_redis_down(&e),
            }
        }
        let mut local = self.local.write().await;
        let before = local.len();
        local.retain(|key, _| !key.starts_with(prefix));
        before - local.len()
    }

    async fn redis_del_prefix(
        &self,
        conn: &mut ConnectionManager,
        prefix: &str,
    ) -> redis::RedisResult<usize> {
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut deleted = 0usize;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(conn)
                .await?;
            if !keys.is_empty() {
                deleted += conn.del::<_, i64>(&keys).await? as usize;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(deleted)
    }

    /// Drop every entry under the prefix in both tiers.
    pub async fn flush_prefix(&self, prefix: &str) -> usize {
        let deleted = self.del_prefix(prefix).await;
        let mut local = self.local.write().await;
        local.retain(|key, _| !key.starts_with(prefix));
        deleted
    }

    /// Evict expired local entries and re-probe Redis.
    pub async fn sweep(&self) {
        {
            let mut local = self.local.write().await;
            let now = Instant::now();
            local.retain(|_, entry| entry.expires_at > now);
        }
        if !self.redis_available.load(Ordering::Relaxed) {
            if let Some(mut conn) = self.redis.clone() {
                let pong: redis::RedisResult<String> =
                    redis::cmd("PING").query_async(&mut conn).await;
                if pong.is_ok() {
                    self.redis_available.store(true, Ordering::Relaxed);
                    tracing::info!("Redis connection restored, resuming external cache tier");
                }
            }
        }
    }

    /// Entries currently held in the local tier (expired included until the
    /// next sweep).
    pub async fn local_len(&self) -> usize {
        self.local.read().await.len()
    }
}
