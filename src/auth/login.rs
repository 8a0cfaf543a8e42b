use std::sync::Arc;

use bytes::Bytes;
use md5::{Digest, Md5};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use serde_json::json;
use tracing::{info, warn};

use crate::cache::{cache_json_get, cache_json_set, CacheStore};
use crate::constants::LOGIN_TTL;
use crate::error::{AppError, AppResult};
use crate::models::{AppConfig, LoginResult, UpstreamConfig};
use crate::store::UserStore;
use crate::upstream::{RequestOptions, UpstreamClient};

/// Login, validity checking and profile fetch against the upstream
/// identity provider. Holds no global state; breaker and cache are the
/// injected collaborators.
pub struct AuthService {
    pub(crate) cache: Arc<dyn CacheStore>,
    pub(crate) upstream: Arc<UpstreamClient>,
    pub(crate) cfg: UpstreamConfig,
    pub(crate) users: UserStore,
    disable_on_bad_credentials: bool,
    bad_credential_threshold: u32,
}

pub(crate) fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub(crate) fn trace_id() -> String {
    format!("{:032x}", rand::thread_rng().gen::<u128>())
}

impl AuthService {
    pub fn new(
        config: &AppConfig,
        cache: Arc<dyn CacheStore>,
        upstream: Arc<UpstreamClient>,
        users: UserStore,
    ) -> Self {
        Self {
            cache,
            upstream,
            cfg: config.upstream.clone(),
            users,
            disable_on_bad_credentials: config.disable_on_bad_credentials,
            bad_credential_threshold: config.bad_credential_threshold.max(1),
        }
    }

    /// Cache key for a login result; the digest doubles as the upstream
    /// wire format for the password.
    pub fn login_cache_key(login_id: &str, password_plain: &str) -> String {
        format!("login:{}:{}", login_id, md5_hex(password_plain))
    }

    /// Perform (or replay from cache) the upstream login exchange.
    ///
    /// `TokenInvalid` when credentials are rejected or the returned token
    /// is unusable; `NetworkError` when the upstream is unreachable after
    /// retries or the breaker is open.
    pub async fn login(&self, login_id: &str, password_plain: &str) -> AppResult<LoginResult> {
        let cache_key = Self::login_cache_key(login_id, password_plain);
        if let Some(cached) = cache_json_get::<LoginResult>(self.cache.as_ref(), &cache_key).await
        {
            return Ok(cached);
        }

        let url = format!("{}/api/v1/auth/login", self.cfg.edu_base);
        let payload = json!({
            "username": login_id,
            "password": md5_hex(password_plain),
            "captcha": null,
            "phoneCountryCode": "",
        });
        let mut headers = HeaderMap::new();
        if let Ok(v) = HeaderValue::from_str(&trace_id()) {
            headers.insert("X-APM-TraceId", v);
        }
        let cookies = "x-auth-app=EasiNote5; x-auth-token=; acw_tc=".to_string();

        let resp = self
            .upstream
            .request_with_retry(
                Method::POST,
                &url,
                headers,
                Some(cookies),
                Some(&payload),
                RequestOptions::default(),
            )
            .await
            .map_err(|e| match e {
                AppError::CircuitOpen | AppError::RequestFailed => AppError::NetworkError,
                other => other,
            })?;

        let data: serde_json::Value = resp.json().await.map_err(|_| AppError::NetworkError)?;
        let token = data
            .pointer("/data/token")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();

        if token.is_empty() || token.ends_with("-offline") || self.is_token_invalid(&token).await
        {
            self.note_bad_credentials(login_id).await;
            return Err(AppError::TokenInvalid);
        }

        let u = data.pointer("/data/user").cloned().unwrap_or(json!({}));
        let get_str = |k: &str| u.get(k).and_then(|v| v.as_str()).map(str::to_string);
        let username = get_str("username").unwrap_or_else(|| login_id.to_string());
        let result = LoginResult {
            token,
            head_img: get_str("photoUrl").unwrap_or_default(),
            phone: get_str("phone").unwrap_or_else(|| login_id.to_string()),
            join_unit_time: u.get("joinUnitTime").and_then(|v| v.as_i64()),
            city_id: get_str("cityId"),
            account_id: get_str("accountId"),
            nick_name: get_str("nickName"),
            real_name: get_str("realName"),
            username: username.clone(),
            user_id: username,
            uid: get_str("uid"),
            app_code: get_str("appCode"),
        };

        cache_json_set(self.cache.as_ref(), &cache_key, &result, Some(LOGIN_TTL)).await;
        self.cache.delete(&format!("badcred:{}", login_id)).await;
        info!(
            "Account logged in: userid({}) ({}, {}, {:?})",
            login_id,
            result.nick_name.as_deref().unwrap_or(""),
            result.real_name.as_deref().unwrap_or(""),
            result.join_unit_time,
        );
        Ok(result)
    }

    /// Count consecutive invalid-credential failures; at the configured
    /// threshold the stored record is flagged inactive so automated
    /// retries stop hammering the upstream with known-bad credentials.
    async fn note_bad_credentials(&self, login_id: &str) {
        warn!("Login rejected: userid={}", login_id);
        let key = format!("badcred:{}", login_id);
        let count = self
            .cache
            .get(&key)
            .await
            .and_then(|raw| String::from_utf8(raw.to_vec()).ok())
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(0)
            + 1;
        self.cache
            .set(&key, Bytes::from(count.to_string()), Some(LOGIN_TTL))
            .await;

        if !self.disable_on_bad_credentials || count < self.bad_credential_threshold {
            return;
        }
        let Ok(mut users) = self.users.load().await else {
            return;
        };
        if let Some(rec) = users.get_mut(login_id) {
            if rec.active {
                rec.active = false;
                warn!("Account auto-disabled after {} bad logins: {}", count, login_id);
                if let Err(e) = self.users.save(users, None).await {
                    warn!("Failed to persist auto-disable for {}: {}", login_id, e);
                }
            }
        }
    }
}
