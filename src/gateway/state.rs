//! Shared handler state and the token index helpers.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::metrics::RequestStats;
use crate::auth::AuthService;
use crate::cache::{cache_json_get, cache_json_set, CacheStore};
use crate::error::AppResult;
use crate::models::{AppConfig, TokenIndexEntry};
use crate::store::UserStore;
use crate::upstream::UpstreamClient;

/// At-most-one-inflight marker set. `try_mark` either hands back a guard
/// that releases the key on drop, or refuses because another holder is
/// already active. Non-acquiring callers skip the work, never wait.
#[derive(Clone, Default)]
pub struct InflightSet {
    keys: Arc<DashMap<String, ()>>,
}

impl InflightSet {
    pub fn try_mark(&self, key: &str) -> Option<InflightGuard> {
        use dashmap::mapref::entry::Entry;
        match self.keys.entry(key.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(InflightGuard {
                    keys: self.keys.clone(),
                    key: key.to_string(),
                })
            }
        }
    }

    pub fn clear(&self, key: &str) {
        self.keys.remove(key);
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }
}

/// Releases the inflight mark on every exit path.
pub struct InflightGuard {
    keys: Arc<DashMap<String, ()>>,
    key: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.keys.remove(&self.key);
    }
}

/// Everything the handlers and the renewal loop share. Cheap to clone;
/// all fields are handles.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub cache: Arc<dyn CacheStore>,
    pub auth: Arc<AuthService>,
    pub users: UserStore,
    pub inflight_tokens: InflightSet,
    pub inflight_users: InflightSet,
    pub stats: Arc<RequestStats>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        cache: Arc<dyn CacheStore>,
        users: UserStore,
    ) -> AppResult<Self> {
        let upstream = Arc::new(UpstreamClient::new(&config.breaker)?);
        let auth = Arc::new(AuthService::new(
            &config,
            cache.clone(),
            upstream,
            users.clone(),
        ));
        Ok(Self {
            config: Arc::new(config),
            cache,
            auth,
            users,
            inflight_tokens: InflightSet::default(),
            inflight_users: InflightSet::default(),
            stats: Arc::new(RequestStats::default()),
        })
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.config.token_ttl_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.config.check_interval_secs)
    }

    /// Write the three token index entries together. Each carries its own
    /// jittered expiry off the same nominal TTL.
    pub async fn write_token_indices(&self, userid: &str, uid: Option<&str>, token: &str) {
        let ttl = Some(self.token_ttl());
        self.cache
            .set(
                &format!("token_by_user:{}", userid),
                Bytes::from(token.to_string()),
                ttl,
            )
            .await;
        if let Some(uid) = uid.filter(|u| !u.is_empty()) {
            self.cache
                .set(
                    &format!("token_by_uid:{}", uid),
                    Bytes::from(token.to_string()),
                    ttl,
                )
                .await;
        }
        let entry = TokenIndexEntry {
            userid: userid.to_string(),
            uid: uid.filter(|u| !u.is_empty()).map(str::to_string),
        };
        cache_json_set(
            self.cache.as_ref(),
            &format!("token_index:{}", token),
            &entry,
            ttl,
        )
        .await;
    }

    /// Re-stamp the index entries for a token that just passed a validity
    /// check, extending their lifetime off a fresh jittered TTL.
    pub async fn refresh_token_indices(&self, userid: &str, token: &str) {
        let uid = cache_json_get::<TokenIndexEntry>(
            self.cache.as_ref(),
            &format!("token_index:{}", token),
        )
        .await
        .and_then(|entry| entry.uid);
        self.write_token_indices(userid, uid.as_deref(), token).await;
    }

    /// Evict everything a dead token touches: the three index entries plus
    /// the owning user's cached login and aggregation results.
    pub async fn invalidate_token_cache(&self, token: &str) {
        let index_key = format!("token_index:{}", token);
        let entry = cache_json_get::<TokenIndexEntry>(self.cache.as_ref(), &index_key).await;
        if let Some(entry) = &entry {
            self.cache
                .delete(&format!("token_by_user:{}", entry.userid))
                .await;
            if let Some(uid) = &entry.uid {
                self.cache.delete(&format!("token_by_uid:{}", uid)).await;
            }
        }
        self.cache.delete(&index_key).await;

        if let Some(entry) = entry {
            for prefix in ["login", "agg"] {
                let keys = self
                    .cache
                    .keys_with_prefix(&format!("{}:{}:", prefix, entry.userid))
                    .await;
                for k in keys {
                    self.cache.delete(&k).await;
                }
            }
            debug!("Token cache invalidated for userid({})", entry.userid);
        }
    }

    /// Check a token once and evict it when the upstream proves it dead.
    /// Only one check per token runs at a time.
    pub async fn validate_and_invalidate(&self, token: &str) {
        let Some(_guard) = self.inflight_tokens.try_mark(token) else {
            return;
        };
        if self.auth.is_token_invalid(token).await {
            self.invalidate_token_cache(token).await;
        }
    }

    /// Merge a freshly fetched profile into the stored record. One refresh
    /// per user at a time; losers of the race return immediately.
    pub async fn refresh_user_profile(
        &self,
        userid: &str,
        token: &str,
        fallback_name: Option<String>,
        fallback_img: Option<String>,
    ) {
        let Some(_guard) = self.inflight_users.try_mark(userid) else {
            return;
        };
        let Ok(mut users) = self.users.load().await else {
            return;
        };
        let Some(rec) = users.get(userid).cloned() else {
            return;
        };

        let fetched = self.auth.fetch_user_info(token).await;
        let pick = |k: &str| {
            fetched
                .get(k)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let new_name = pick("nickName")
            .or(fallback_name)
            .unwrap_or_else(|| rec.user_nickname.clone());
        let new_img = pick("photoUrl")
            .or(fallback_img)
            .unwrap_or_else(|| rec.head_img.clone());
        let real_name = pick("realName").or_else(|| rec.user_realname.clone());

        let changed = new_name != rec.user_nickname
            || new_img != rec.head_img
            || real_name != rec.user_realname;
        let mut updated = rec;
        updated.user_nickname = new_name;
        updated.head_img = new_img;
        updated.user_realname = real_name;
        users.insert(userid.to_string(), updated);
        if let Err(e) = self.users.save(users, None).await {
            warn!("Profile refresh save failed for {}: {}", userid, e);
            return;
        }
        if changed {
            info!("Account profile refreshed: userid({})", userid);
        }
    }
}
