use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::Method;
use bytes::Bytes;
use dashmap::DashMap;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::AsyncCommands;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::RedisConfig;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("cache store is at capacity")]
    Full,

    #[error("cache store unavailable: {0}")]
    Unavailable(String),
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Identity of a cacheable request: method, path and raw query only.
///
/// Headers and body never take part, so two requests that differ only in
/// e.g. `Authorization` share one entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(method: &Method, path: &str, query: Option<&str>) -> Self {
        // A path never contains '?', so the query boundary is unambiguous.
        match query {
            Some(query) => Self(format!("{} {}?{}", method.as_str(), path, query)),
            None => Self(format!("{} {}", method.as_str(), path)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key-value store holding cached response bodies.
///
/// Expiry is the store's job; callers never delete.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    async fn get(&self, key: &CacheKey) -> CacheResult<Option<Bytes>>;

    async fn put(&self, key: &CacheKey, value: Bytes, ttl: Duration) -> CacheResult<()>;

    fn backend_name(&self) -> &'static str;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    body: Bytes,
    inserted_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

/// In-process store with per-entry TTL and a hard entry bound.
pub struct MemoryStore {
    entries: Arc<DashMap<String, CacheEntry>>,
    max_entries: usize,
}

impl MemoryStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            max_entries,
        }
    }

    /// Periodically drop expired entries so memory tracks live data.
    pub fn spawn_sweeper(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let entries = self.entries.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);

            loop {
                interval.tick().await;

                let now = Instant::now();
                let before = entries.len();
                entries.retain(|_, entry| !entry.is_expired(now));
                let swept = before.saturating_sub(entries.len());

                if swept > 0 {
                    debug!("Swept {} expired cache entries", swept);
                }
            }
        })
    }

    /// Evict one entry; used by operators and tests, never by the request path.
    pub fn remove(&self, key: &CacheKey) -> bool {
        self.entries.remove(key.as_str()).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &CacheKey) -> CacheResult<Option<Bytes>> {
        let now = Instant::now();

        if let Some(entry) = self.entries.get(key.as_str()) {
            if !entry.is_expired(now) {
                return Ok(Some(entry.body.clone()));
            }
        } else {
            return Ok(None);
        }

        // Expired: the read guard is gone, drop the entry unless it was refreshed meanwhile.
        self.entries
            .remove_if(key.as_str(), |_, entry| entry.is_expired(now));
        Ok(None)
    }

    async fn put(&self, key: &CacheKey, value: Bytes, ttl: Duration) -> CacheResult<()> {
        // The bound is approximate: concurrent puts may each pass the check.
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(key.as_str()) {
            let now = Instant::now();
            self.entries.retain(|_, entry| !entry.is_expired(now));
            if self.entries.len() >= self.max_entries {
                return Err(CacheError::Full);
            }
        }

        self.entries.insert(
            key.as_str().to_string(),
            CacheEntry {
                body: value,
                inserted_at: Instant::now(),
                ttl,
            },
        );
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Redis-backed store; expiry is enforced by Redis via `SET .. EX`.
pub struct RedisStore {
    manager: ConnectionManager,
    key_prefix: String,
}

impl RedisStore {
    pub async fn connect(config: &RedisConfig) -> CacheResult<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let manager_config = ConnectionManagerConfig::new()
            .set_response_timeout(config.response_timeout)
            .set_connection_timeout(config.connection_timeout);
        let manager = ConnectionManager::new_with_config(client, manager_config).await?;

        info!(
            "Connected to redis cache store at {} (response timeout {:?})",
            config.url, config.response_timeout
        );

        Ok(Self {
            manager,
            key_prefix: config.key_prefix.clone(),
        })
    }

    fn redis_key(&self, key: &CacheKey) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &CacheKey) -> CacheResult<Option<Bytes>> {
        let mut conn = self.manager.clone();
        let value: Option<Vec<u8>> = conn.get(self.redis_key(key)).await?;
        Ok(value.map(Bytes::from))
    }

    async fn put(&self, key: &CacheKey, value: Bytes, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.manager.clone();
        // EX 0 is rejected by redis
        let seconds = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(self.redis_key(key), &value[..], seconds)
            .await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
