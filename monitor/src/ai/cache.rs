//! Analysis cache backends
//!
//! Backends never surface errors to the engine. A backend that cannot answer
//! reports a miss, so the worst case is a paid call that could have been
//! avoided.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::Analysis;
use crate::config::{AiCacheConfig, CacheKind};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub entries: u64,
}

#[async_trait]
pub trait AnalysisCache: Send + Sync {
    /// Live entry for `key`; expired entries are misses
    async fn get(&self, key: &str) -> Option<Analysis>;

    async fn set(&self, key: &str, value: &Analysis, ttl: Duration);

    async fn clear(&self);

    /// Drop expired entries, returning how many were removed
    async fn sweep(&self) -> usize {
        0
    }

    fn backend(&self) -> &'static str;

    fn stats(&self) -> CacheStats;
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    evictions: AtomicU64,
}

impl Counters {
    fn snapshot(&self, entries: u64) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries,
        }
    }
}

/// Process-local TTL cache
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (Analysis, Instant)>>,
    counters: Counters,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, (Analysis, Instant)>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl AnalysisCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<Analysis> {
        let mut entries = self.lock();
        let now = Instant::now();

        let hit = match entries.get(key) {
            Some((value, expires_at)) if *expires_at > now => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => None,
        };

        let counter = if hit.is_some() {
            &self.counters.hits
        } else {
            &self.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        hit
    }

    async fn set(&self, key: &str, value: &Analysis, ttl: Duration) {
        self.lock()
            .insert(key.to_string(), (value.clone(), Instant::now() + ttl));
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
    }

    async fn clear(&self) {
        self.lock().clear();
    }

    async fn sweep(&self) -> usize {
        let mut entries = self.lock();
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        let removed = before - entries.len();
        if removed > 0 {
            self.counters
                .evictions
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "Swept expired analysis cache entries");
        }
        removed
    }

    fn backend(&self) -> &'static str {
        "memory"
    }

    fn stats(&self) -> CacheStats {
        let entries = self.lock().len() as u64;
        self.counters.snapshot(entries)
    }
}

/// Upper bound on establishing the Redis connection
#[cfg(feature = "redis-cache")]
const REDIS_CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

/// How long lookups skip Redis after a failed connect
#[cfg(feature = "redis-cache")]
const REDIS_RETRY_BACKOFF: std::time::Duration = std::time::Duration::from_secs(30);

#[cfg(feature = "redis-cache")]
#[derive(Default)]
struct RedisConnection {
    manager: Option<redis::aio::ConnectionManager>,
    retry_after: Option<tokio::time::Instant>,
}

/// Redis-backed cache shared between monitor instances
#[cfg(feature = "redis-cache")]
pub struct RedisCache {
    client: redis::Client,
    prefix: String,
    connection: tokio::sync::Mutex<RedisConnection>,
    counters: Counters,
}

#[cfg(feature = "redis-cache")]
impl RedisCache {
    pub fn new(url: &str, prefix: impl Into<String>) -> Result<Self, crate::error::CacheError> {
        let client = redis::Client::open(url).map_err(|e| crate::error::CacheError::Unavailable {
            reason: e.to_string(),
        })?;
        Ok(Self {
            client,
            prefix: prefix.into(),
            connection: tokio::sync::Mutex::new(RedisConnection::default()),
            counters: Counters::default(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn manager(&self) -> Option<redis::aio::ConnectionManager> {
        let mut state = self.connection.lock().await;
        if let Some(manager) = &state.manager {
            return Some(manager.clone());
        }
        if let Some(retry_after) = state.retry_after {
            if tokio::time::Instant::now() < retry_after {
                return None;
            }
        }

        let reason = match tokio::time::timeout(
            REDIS_CONNECT_TIMEOUT,
            self.client.get_connection_manager(),
        )
        .await
        {
            Ok(Ok(manager)) => {
                state.retry_after = None;
                state.manager = Some(manager.clone());
                return Some(manager);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("connect timed out after {:?}", REDIS_CONNECT_TIMEOUT),
        };

        warn!(
            error = %reason,
            retry_in_secs = REDIS_RETRY_BACKOFF.as_secs(),
            "Redis cache unavailable, treating as miss"
        );
        state.retry_after = Some(tokio::time::Instant::now() + REDIS_RETRY_BACKOFF);
        None
    }
}

#[cfg(feature = "redis-cache")]
#[async_trait]
impl AnalysisCache for RedisCache {
    async fn get(&self, key: &str) -> Option<Analysis> {
        let hit = match self.manager().await {
            Some(mut manager) => {
                let raw: redis::RedisResult<Option<String>> = redis::cmd("GET")
                    .arg(self.full_key(key))
                    .query_async(&mut manager)
                    .await;
                match raw {
                    Ok(Some(json)) => match serde_json::from_str(&json) {
                        Ok(value) => Some(value),
                        Err(e) => {
                            warn!(error = %e, "Discarding undecodable cache entry");
                            None
                        }
                    },
                    Ok(None) => None,
                    Err(e) => {
                        warn!(error = %e, "Redis GET failed");
                        None
                    }
                }
            }
            None => None,
        };

        let counter = if hit.is_some() {
            &self.counters.hits
        } else {
            &self.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        hit
    }

    async fn set(&self, key: &str, value: &Analysis, ttl: Duration) {
        let Some(mut manager) = self.manager().await else {
            return;
        };
        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to encode cache entry");
                return;
            }
        };
        let result: redis::RedisResult<()> = redis::cmd("SET")
            .arg(self.full_key(key))
            .arg(json)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut manager)
            .await;
        match result {
            Ok(()) => {
                self.counters.sets.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!(error = %e, "Redis SET failed"),
        }
    }

    async fn clear(&self) {
        let Some(mut manager) = self.manager().await else {
            return;
        };
        let keys: redis::RedisResult<Vec<String>> = redis::cmd("KEYS")
            .arg(format!("{}*", self.prefix))
            .query_async(&mut manager)
            .await;
        if let Ok(keys) = keys {
            if !keys.is_empty() {
                let deleted: redis::RedisResult<u64> =
                    redis::cmd("DEL").arg(keys).query_async(&mut manager).await;
                if let Err(e) = deleted {
                    warn!(error = %e, "Redis DEL failed");
                }
            }
        }
    }

    fn backend(&self) -> &'static str {
        "redis"
    }

    fn stats(&self) -> CacheStats {
        self.counters.snapshot(0)
    }
}

/// Build the backend selected by configuration
pub fn build_cache(config: &AiCacheConfig) -> Arc<dyn AnalysisCache> {
    match config.kind {
        CacheKind::Memory => Arc::new(MemoryCache::new()),
        #[cfg(feature = "redis-cache")]
        CacheKind::Redis => match RedisCache::new(&config.redis_url, config.prefix.clone()) {
            Ok(cache) => Arc::new(cache),
            Err(e) => {
                warn!(error = %e, "Falling back to in-memory analysis cache");
                Arc::new(MemoryCache::new())
            }
        },
        #[cfg(not(feature = "redis-cache"))]
        CacheKind::Redis => {
            warn!("Built without the redis-cache feature, using in-memory analysis cache");
            Arc::new(MemoryCache::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn analysis() -> Analysis {
        Analysis {
            root_cause: Some(serde_json::json!({"cause": "missing index"})),
            optimization: None,
            model: "claude-3-haiku-20240307".to_string(),
            tokens: 420,
            analyzed_at: Utc::now(),
            cached: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_cache_ttl() {
        let cache = MemoryCache::new();
        cache.set("k", &analysis(), Duration::from_secs(60)).await;

        assert!(cache.get("k").await.is_some());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get("k").await.is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_and_clear() {
        let cache = MemoryCache::new();
        cache.set("short", &analysis(), Duration::from_secs(5)).await;
        cache.set("long", &analysis(), Duration::from_secs(500)).await;

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.sweep().await, 1);
        assert_eq!(cache.stats().entries, 1);

        cache.clear().await;
        assert!(cache.get("long").await.is_none());
    }

    #[tokio::test]
    async fn test_factory_defaults_to_memory() {
        let cache = build_cache(&AiCacheConfig::default());
        assert_eq!(cache.backend(), "memory");
    }

    #[cfg(feature = "redis-cache")]
    #[tokio::test]
    async fn test_unreachable_redis_backs_off() {
        let cache = RedisCache::new("redis://127.0.0.1:1/", "test:").unwrap();

        assert!(cache.get("k").await.is_none());
        let retry_after = cache.connection.lock().await.retry_after;
        assert!(retry_after.is_some());

        // inside the backoff window no new connect is attempted
        let started = std::time::Instant::now();
        assert!(cache.get("k").await.is_none());
        cache.set("k", &analysis(), Duration::from_secs(60)).await;
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(cache.connection.lock().await.retry_after, retry_after);
    }
}
