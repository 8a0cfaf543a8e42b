use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::time::Instant;
use tracing::warn;

use super::{ttl_with_jitter, CacheStore, DEFAULT_TTL};
use crate::constants::{MIRROR_TTL, NEGATIVE_TTL};
use crate::error::AppResult;

struct MirrorEntry {
    value: Bytes,
    expires_at: Instant,
}

/// Two-tier cache: a fast in-memory mirror with its own short jittered TTL
/// in front of a sqlite backing file, plus negative-caching of misses so
/// repeated absent-key lookups skip the disk.
///
/// All sqlite access runs on the blocking pool. The backing tier stores
/// wall-clock expiry so entries survive a process restart.
pub struct TieredCache {
    conn: Arc<Mutex<Connection>>,
    mirror: DashMap<String, MirrorEntry>,
    misses: DashMap<String, Instant>,
}

impl TieredCache {
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(sqlite_io)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key        TEXT PRIMARY KEY,
                value      BLOB NOT NULL,
                expires_at INTEGER
            );",
        )
        .map_err(sqlite_io)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            mirror: DashMap::new(),
            misses: DashMap::new(),
        })
    }

    async fn with_conn<T, F>(&self, op: &'static str, f: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let joined = tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&guard)
        })
        .await;
        match joined {
            Ok(Ok(v)) => Some(v),
            Ok(Err(e)) => {
                warn!("Cache backing {} failed: {}", op, e);
                None
            }
            Err(e) => {
                warn!("Cache backing {} join error: {}", op, e);
                None
            }
        }
    }
}

fn sqlite_io(e: rusqlite::Error) -> crate::error::AppError {
    std::io::Error::new(std::io::ErrorKind::Other, e).into()
}

fn epoch_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[async_trait]
impl CacheStore for TieredCache {
    async fn get(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();

        if let Some(miss) = self.misses.get(key) {
            if *miss > now {
                return None;
            }
        }
        if let Some(entry) = self.mirror.get(key) {
            if entry.expires_at > now {
                return Some(entry.value.clone());
            }
        }
        self.mirror.remove_if(key, |_, e| e.expires_at <= now);

        let k = key.to_string();
        let row: Option<Option<(Vec<u8>, Option<i64>)>> = self
            .with_conn("get", move |conn| {
                conn.query_row(
                    "SELECT value, expires_at FROM kv WHERE key = ?1",
                    params![k],
                    |r| Ok((r.get::<_, Vec<u8>>(0)?, r.get::<_, Option<i64>>(1)?)),
                )
                .optional()
            })
            .await;

        let live = match row.flatten() {
            Some((value, expires_at)) => match expires_at {
                Some(exp) if exp <= epoch_now() => None,
                _ => Some(Bytes::from(value)),
            },
            None => None,
        };

        match live {
            Some(value) => {
                self.mirror.insert(
                    key.to_string(),
                    MirrorEntry {
                        value: value.clone(),
                        expires_at: now + ttl_with_jitter(MIRROR_TTL),
                    },
                );
                Some(value)
            }
            None => {
                self.misses
                    .insert(key.to_string(), now + ttl_with_jitter(NEGATIVE_TTL));
                None
            }
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) {
        let ttl = ttl_with_jitter(ttl.unwrap_or(DEFAULT_TTL));
        // A standing negative entry must never shadow this write.
        self.misses.remove(key);
        self.mirror.insert(
            key.to_string(),
            MirrorEntry {
                value: value.clone(),
                expires_at: Instant::now() + ttl,
            },
        );

        let k = key.to_string();
        let data = value.to_vec();
        let expires_at = epoch_now() + ttl.as_secs() as i64;
        self.with_conn("set", move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
                params![k, data, expires_at],
            )
            .map(|_| ())
        })
        .await;
    }

    async fn delete(&self, key: &str) {
        self.mirror.remove(key);
        self.misses.remove(key);
        let k = key.to_string();
        self.with_conn("delete", move |conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![k]).map(|_| ())
        })
        .await;
    }

    async fn clear(&self) {
        self.mirror.clear();
        self.misses.clear();
        self.with_conn("clear", move |conn| {
            conn.execute("DELETE FROM kv", []).map(|_| ())
        })
        .await;
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let pattern = format!("{}%", prefix);
        let now = epoch_now();
        self.with_conn("keys", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key FROM kv WHERE key LIKE ?1
                 AND (expires_at IS NULL OR expires_at > ?2)",
            )?;
            let rows = stmt.query_map(params![pattern, now], |r| r.get::<_, String>(0))?;
            rows.collect()
        })
        .await
        .unwrap_or_default()
    }

    async fn count_with_prefix(&self, prefix: &str) -> usize {
        let pattern = format!("{}%", prefix);
        let now = epoch_now();
        self.with_conn("count", move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM kv WHERE key LIKE ?1
                 AND (expires_at IS NULL OR expires_at > ?2)",
                params![pattern, now],
                |r| r.get::<_, i64>(0),
            )
        })
        .await
        .map(|n| n as usize)
        .unwrap_or(0)
    }
}
