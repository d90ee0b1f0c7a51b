//! Expiring key-value stores
//!
//! The dedup filter and the node resolver only need two capabilities from a
//! backend: an atomic test-and-set with expiry, and an atomic multi-field
//! upsert with expiry. [`ExpiringStore`] captures exactly that, with two
//! implementations:
//!
//! - [`MemoryStore`]: process-local, LRU bounded per keyspace, per-entry deadlines
//! - `RedisStore`: shared Redis server (requires the `redis` feature)
//!
//! Deadlines use `tokio::time::Instant`, so tests can pause the runtime
//! clock and advance past an expiry without sleeping.

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::config::StoreConfig;
use crate::error::{ExporterError, Result};

/// Expiring key-value capability shared by the dedup filter and node resolver
#[async_trait]
pub trait ExpiringStore: Send + Sync {
    /// Atomically create `key` with the given expiry if it does not exist
    ///
    /// Returns `true` if the key was created, `false` if it already existed.
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Read a single field of a hash entry
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>>;

    /// Atomically write all `fields` of a hash entry and reset its expiry
    async fn hash_set(&self, key: &str, fields: &[(&str, String)], ttl: Duration) -> Result<()>;

    /// Backend name (for logging)
    fn backend(&self) -> &str;
}

/// Open the store selected by configuration
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn ExpiringStore>> {
    match config {
        StoreConfig::Memory { max_entries } => {
            info!(max_entries, "Using in-memory metadata store");
            Ok(Arc::new(MemoryStore::with_capacity(*max_entries)))
        }
        #[cfg(feature = "redis")]
        StoreConfig::Redis { .. } => {
            let url = config
                .redis_url()
                .ok_or_else(|| ExporterError::MissingConfig("REDIS_HOST".to_string()))?;
            let store = RedisStore::connect(&url).await?;
            info!(url = %url, "Using Redis metadata store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        StoreConfig::Redis { .. } => Err(ExporterError::InvalidConfig(
            "redis store requested but mesh-exporter was built without the `redis` feature"
                .to_string(),
        )),
    }
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn new(value: T, expires_at: Instant) -> Self {
        Self { value, expires_at }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

type Hash = HashMap<String, Vec<u8>>;

/// LRU-bounded in-memory store with per-entry expiry
///
/// Markers and hashes live in separate LRU caches of `capacity` entries
/// each, so a flood of dedup markers never evicts node metadata. All
/// operations take a single lock, so test-and-set and multi-field upserts
/// are atomic with respect to each other.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug)]
struct MemoryInner {
    markers: LruCache<String, Expiring<()>>,
    hashes: LruCache<String, Expiring<Hash>>,
}

impl MemoryStore {
    /// Create a store with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(crate::config::DEFAULT_CACHE_MAX_ENTRIES)
    }

    /// Create a store holding at most `capacity` markers and `capacity` hashes
    pub fn with_capacity(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(MemoryInner {
                markers: LruCache::new(cap),
                hashes: LruCache::new(cap),
            }),
        }
    }

    /// Number of entries currently held, including ones not yet purged
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.markers.len() + inner.hashes.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries per keyspace (markers, hashes)
    pub fn capacity(&self) -> usize {
        self.inner.lock().markers.cap().get()
    }

    /// Drop every expired entry, returning how many were removed
    ///
    /// Lookups already ignore expired entries; this only reclaims memory.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let removed = purge(&mut inner.markers, now) + purge(&mut inner.hashes, now);
        if removed > 0 {
            debug!(count = removed, "Purged expired store entries");
        }
        removed
    }
}

fn purge<T>(cache: &mut LruCache<String, Expiring<T>>, now: Instant) -> usize {
    let expired: Vec<String> = cache
        .iter()
        .filter(|(_, entry)| entry.is_expired(now))
        .map(|(key, _)| key.clone())
        .collect();
    for key in &expired {
        cache.pop(key);
    }
    expired.len()
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExpiringStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if let Some(entry) = inner.markers.get(key) {
            if !entry.is_expired(now) {
                return Ok(false);
            }
            trace!(key, "Store entry expired, replacing");
        }

        inner
            .markers
            .put(key.to_string(), Expiring::new((), now + ttl));
        Ok(true)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired = match inner.hashes.get(key) {
            None => return Ok(None),
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => return Ok(entry.value.get(field).cloned()),
        };

        if expired {
            inner.hashes.pop(key);
        }
        Ok(None)
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)], ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let mut hash = match inner.hashes.pop(key) {
            Some(entry) if !entry.is_expired(now) => entry.value,
            _ => Hash::new(),
        };
        for (field, value) in fields {
            hash.insert((*field).to_string(), value.as_bytes().to_vec());
        }

        inner
            .hashes
            .put(key.to_string(), Expiring::new(hash, now + ttl));
        Ok(())
    }

    fn backend(&self) -> &str {
        "memory"
    }
}

// ============================================================================
// Redis store
// ============================================================================

#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

#[cfg(feature = "redis")]
mod redis_store {
    use super::*;
    use redis::aio::ConnectionManager;

    /// Redis-backed store
    ///
    /// Dedup markers use `SET key 1 NX EX ttl`; metadata upserts run `HSET`
    /// and `EXPIRE` inside one `MULTI`/`EXEC` pipeline.
    #[derive(Clone)]
    pub struct RedisStore {
        conn: ConnectionManager,
        url: String,
    }

    impl RedisStore {
        /// Connect to the Redis server at `url`
        pub async fn connect(url: &str) -> Result<Self> {
            let client = redis::Client::open(url)
                .map_err(|e| ExporterError::InvalidConfig(format!("redis url {}: {}", url, e)))?;
            let conn = ConnectionManager::new(client).await?;
            Ok(Self {
                conn,
                url: url.to_string(),
            })
        }

        /// Connection URL
        pub fn url(&self) -> &str {
            &self.url
        }
    }

    fn expiry_secs(ttl: Duration) -> u64 {
        ttl.as_secs().max(1)
    }

    #[async_trait]
    impl ExpiringStore for RedisStore {
        async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool> {
            let mut conn = self.conn.clone();
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(1)
                .arg("NX")
                .arg("EX")
                .arg(expiry_secs(ttl))
                .query_async(&mut conn)
                .await?;
            Ok(reply.is_some())
        }

        async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
            let mut conn = self.conn.clone();
            let value: Option<Vec<u8>> = redis::cmd("HGET")
                .arg(key)
                .arg(field)
                .query_async(&mut conn)
                .await?;
            Ok(value)
        }

        async fn hash_set(
            &self,
            key: &str,
            fields: &[(&str, String)],
            ttl: Duration,
        ) -> Result<()> {
            let mut conn = self.conn.clone();
            let _: () = redis::pipe()
                .atomic()
                .hset_multiple(key, fields)
                .ignore()
                .expire(key, expiry_secs(ttl) as i64)
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok(())
        }

        fn backend(&self) -> &str {
            "redis"
        }
    }

}
