use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::time::Instant;

use super::{ttl_with_jitter, CacheStore, DEFAULT_TTL};

struct MemEntry {
    value: Bytes,
    expires_at: Instant,
    /// Logical access clock stamp; the smallest stamp is the LRU victim.
    touched: AtomicU64,
}

/// Capacity-bounded in-memory cache with per-entry jittered expiry.
///
/// Once over capacity the least-recently-used live entry is evicted;
/// expired entries go first. An early eviction is indistinguishable from
/// a natural expiry to callers.
pub struct MemoryCache {
    entries: DashMap<String, MemEntry>,
    capacity: usize,
    clock: AtomicU64,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn evict_over_capacity(&self) {
        if self.entries.len() <= self.capacity {
            return;
        }
        let now = Instant::now();
        self.entries.retain(|_, e| e.expires_at > now);

        while self.entries.len() > self.capacity {
            let victim = self
                .entries
                .iter()
                .min_by_key(|e| e.value().touched.load(Ordering::Relaxed))
                .map(|e| e.key().clone());
            match victim {
                Some(k) => {
                    self.entries.remove(&k);
                }
                None => break,
            }
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                entry.touched.store(self.tick(), Ordering::Relaxed);
                return Some(entry.value.clone());
            }
        } else {
            return None;
        }
        // Expired: purge opportunistically.
        self.entries.remove(key);
        None
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) {
        let ttl = ttl_with_jitter(ttl.unwrap_or(DEFAULT_TTL));
        self.entries.insert(
            key.to_string(),
            MemEntry {
                value,
                expires_at: Instant::now() + ttl,
                touched: AtomicU64::new(self.tick()),
            },
        );
        self.evict_over_capacity();
    }

    async fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    async fn clear(&self) {
        self.entries.clear();
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| e.value().expires_at > now && e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_round_trip() {
        let cache = MemoryCache::new(16);
        cache
            .set("k", Bytes::from_static(b"v"), Some(Duration::from_secs(60)))
            .await;
        assert_eq!(cache.get("k").await, Some(Bytes::from_static(b"v")));
    }

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let cache = MemoryCache::new(16);
        assert_eq!(cache.get("nope").await, None);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let cache = MemoryCache::new(16);
        cache.set("a", Bytes::from_static(b"1"), None).await;
        cache.set("b", Bytes::from_static(b"2"), None).await;
        cache.delete("a").await;
        assert_eq!(cache.get("a").await, None);
        assert!(cache.get("b").await.is_some());
        cache.clear().await;
        assert_eq!(cache.get("b").await, None);
    }

    #[tokio::test]
    async fn test_lru_eviction_over_capacity() {
        let cache = MemoryCache::new(2);
        cache.set("a", Bytes::from_static(b"1"), None).await;
        cache.set("b", Bytes::from_static(b"2"), None).await;
        // Touch "a" so "b" becomes the LRU victim.
        let _ = cache.get("a").await;
        cache.set("c", Bytes::from_static(b"3"), None).await;
        assert!(cache.get("a").await.is_some());
        assert_eq!(cache.get("b").await, None);
        assert!(cache.get("c").await.is_some());
    }

    #[tokio::test]
    async fn test_keys_with_prefix() {
        let cache = MemoryCache::new(16);
        cache.set("token_index:t1", Bytes::from_static(b"x"), None).await;
        cache.set("token_index:t2", Bytes::from_static(b"y"), None).await;
        cache.set("login:u1", Bytes::from_static(b"z"), None).await;
        let mut keys = cache.keys_with_prefix("token_index:").await;
        keys.sort();
        assert_eq!(keys, vec!["token_index:t1", "token_index:t2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_reads_as_miss() {
        let cache = MemoryCache::new(16);
        cache
            .set("k", Bytes::from_static(b"v"), Some(Duration::from_secs(10)))
            .await;
        // Jitter caps the effective TTL at 12s.
        tokio::time::advance(Duration::from_secs(13)).await;
        assert_eq!(cache.get("k").await, None);
        assert!(cache.keys_with_prefix("k").await.is_empty());
    }
}
