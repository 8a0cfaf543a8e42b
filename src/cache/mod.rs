//! TTL key/value caching.
//!
//! Two implementations share one contract: a capacity-bounded in-memory
//! store and a two-tier store with an in-memory mirror over a sqlite
//! backing file. Every write goes through [`ttl_with_jitter`], so entries
//! configured with the same nominal TTL never expire in lockstep.

pub mod memory;
pub mod tiered;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;

pub use memory::MemoryCache;
pub use tiered::TieredCache;

/// Fallback nominal TTL when a caller passes none.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Returns the value unless absent or expired. Expired entries are
    /// indistinguishable from absent ones and may be purged on read.
    async fn get(&self, key: &str) -> Option<Bytes>;

    /// Stores under a jittered TTL derived from `ttl` (or [`DEFAULT_TTL`]).
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>);

    async fn delete(&self, key: &str);

    async fn clear(&self);

    /// Keys currently live under the given prefix. Used by the renewal
    /// sweep over `token_index:` and by token invalidation.
    async fn keys_with_prefix(&self, prefix: &str) -> Vec<String>;

    /// Live keys under the prefix, counted. Backing-store implementations
    /// may count without materializing the keys.
    async fn count_with_prefix(&self, prefix: &str) -> usize {
        self.keys_with_prefix(prefix).await.len()
    }
}

/// Jitter a nominal TTL into `[0.8B, 1.2B]` with a 5 second floor.
pub fn ttl_with_jitter(base: Duration) -> Duration {
    let j = rand::thread_rng().gen_range(0.8..1.2);
    let secs = (base.as_secs_f64() * j).max(5.0);
    Duration::from_secs_f64(secs)
}

/// `get` decoded as JSON; malformed or absent values read as `None`.
pub async fn cache_json_get<T: serde::de::DeserializeOwned>(
    cache: &dyn CacheStore,
    key: &str,
) -> Option<T> {
    let raw = cache.get(key).await?;
    serde_json::from_slice(&raw).ok()
}

/// Serialize and `set`. Serialization failures are logged, not propagated;
/// a dropped cache write degrades to a miss.
pub async fn cache_json_set<T: serde::Serialize>(
    cache: &dyn CacheStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) {
    match serde_json::to_vec(value) {
        Ok(data) => cache.set(key, Bytes::from(data), ttl).await,
        Err(e) => tracing::warn!("Cache serialize failed for {}: {}", key, e),
    }
}
