//! Persisted user records: `users.json` with an mtime-keyed in-process
//! cache and optimistic concurrency on save.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::AppResult;
use crate::models::UserRecord;

#[derive(Debug, Serialize, Deserialize, Default)]
struct UsersFile {
    #[serde(default)]
    users: HashMap<String, UserRecord>,
}

#[derive(Default)]
struct CachedUsers {
    map: Option<HashMap<String, UserRecord>>,
    mtime: Option<SystemTime>,
}

/// File-backed store. Cheap to clone; clones share the cache.
#[derive(Clone)]
pub struct UserStore {
    path: PathBuf,
    cached: Arc<Mutex<CachedUsers>>,
}

impl UserStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join("users.json"),
            cached: Arc::new(Mutex::new(CachedUsers::default())),
        }
    }

    pub async fn mtime(&self) -> Option<SystemTime> {
        let meta = tokio::fs::metadata(&self.path).await.ok()?;
        meta.modified().ok()
    }

    /// Current records. Re-reads the file only when its mtime moved.
    pub async fn load(&self) -> AppResult<HashMap<String, UserRecord>> {
        let mtime = self.mtime().await;
        let mut cached = self.cached.lock().await;
        if let (Some(map), true) = (&cached.map, mtime.is_some() && mtime == cached.mtime) {
            return Ok(map.clone());
        }
        let map = match tokio::fs::read(&self.path).await {
            Ok(raw) => serde_json::from_slice::<UsersFile>(&raw)?.users,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        cached.map = Some(map.clone());
        cached.mtime = mtime;
        Ok(map)
    }

    pub async fn find(&self, userid: &str) -> AppResult<Option<UserRecord>> {
        Ok(self.load().await?.get(userid).cloned())
    }

    /// Best-effort optimistic save: with `expected_mtime` set, a file that
    /// changed since the caller loaded it is left alone and `false` is
    /// returned. Writes go through a tmp file and atomic rename.
    pub async fn save(
        &self,
        users: HashMap<String, UserRecord>,
        expected_mtime: Option<SystemTime>,
    ) -> AppResult<bool> {
        if let Some(expected) = expected_mtime {
            if self.mtime().await != Some(expected) {
                debug!("users.json changed concurrently, skipping save");
                return Ok(false);
            }
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(&UsersFile { users: users.clone() })?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &payload).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        let mut cached = self.cached.lock().await;
        cached.map = Some(users);
        cached.mtime = self.mtime().await;
        Ok(true)
    }
}
