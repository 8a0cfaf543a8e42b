use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{error, info};

use super::login::{md5_hex, trace_id, AuthService};
use crate::cache::{cache_json_get, cache_json_set};
use crate::constants::{mask_token, LOGIN_TTL, USERINFO_TTL};
use crate::error::AppResult;
use crate::upstream::RequestOptions;

impl AuthService {
    /// Fetch the upstream profile for a live token. Failures never
    /// propagate; callers get an empty object and carry on.
    pub async fn fetch_user_info(&self, token: &str) -> Value {
        let url = format!("{}/api/v2/user/info", self.cfg.edu_base);
        let mut headers = HeaderMap::new();
        if let Ok(v) = HeaderValue::from_str(&trace_id()) {
            headers.insert("X-APM-TraceId", v);
        }
        let cookies = format!("x-auth-app=EasiNote5; x-auth-token={}", token);

        let result = async {
            let resp = self
                .upstream
                .request_with_retry(
                    Method::GET,
                    &url,
                    headers,
                    Some(cookies),
                    None,
                    RequestOptions::default(),
                )
                .await?;
            let data: Value = resp.json().await?;
            Ok::<_, crate::error::AppError>(data.get("data").cloned().unwrap_or(json!({})))
        }
        .await;

        let result = match result {
            Ok(v) => v,
            Err(e) => {
                error!("Profile fetch failed: token={} err={}", mask_token(token), e);
                return json!({});
            }
        };

        // Diff against the last-seen payload so profile changes show up
        // in the log exactly once.
        let uid = result
            .get("uid")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if !uid.is_empty() {
            let key = format!("userinfo:last:{}", uid);
            let prev = cache_json_get::<Value>(self.cache.as_ref(), &key).await;
            let changed = prev.map(|p| p != result).unwrap_or(false);
            let ttl = USERINFO_TTL.max(Duration::from_secs(3600));
            cache_json_set(self.cache.as_ref(), &key, &result, Some(ttl)).await;
            if changed {
                info!("Account profile updated: {}", uid);
            }
        }
        result
    }

    /// Login merged with the profile fetch, cached as one unit and
    /// optionally projected down to requested fields.
    pub async fn aggregated_user_info(
        &self,
        user_id: &str,
        password_plain: &str,
        fields: Option<&[String]>,
    ) -> AppResult<Value> {
        let cache_key = format!("agg:{}:{}", user_id, md5_hex(password_plain));
        if let Some(cached) = cache_json_get::<Value>(self.cache.as_ref(), &cache_key).await {
            return Ok(select_fields(cached, fields));
        }

        // The stored record maps the external id to the phone the
        // upstream login actually wants.
        let phone_for_login = self
            .users
            .find(user_id)
            .await
            .ok()
            .flatten()
            .and_then(|rec| rec.phone)
            .unwrap_or_else(|| user_id.to_string());

        let login = self.login(&phone_for_login, password_plain).await?;
        let info = if login.token.is_empty() {
            json!({})
        } else {
            self.fetch_user_info(&login.token).await
        };

        let pick = |k: &str, fallback: Option<&str>| -> Value {
            info.get(k)
                .filter(|v| !v.is_null())
                .cloned()
                .or_else(|| fallback.map(|s| Value::String(s.to_string())))
                .unwrap_or(Value::Null)
        };
        let mut agg = json!({
            "token": login.token,
            "head_img": pick("photoUrl", Some(&login.head_img)),
            "photoUrl": info.get("photoUrl").cloned().unwrap_or(Value::Null),
            "phone": pick("phone", Some(&login.phone)),
            "joinUnitTime": info.get("joinUnitTime").cloned()
                .or_else(|| login.join_unit_time.map(Value::from)).unwrap_or(Value::Null),
            "cityId": pick("cityId", login.city_id.as_deref()),
            "accountId": pick("accountId", login.account_id.as_deref()),
            "accountType": info.get("accountType").cloned().unwrap_or(Value::Null),
            "address": info.get("address").cloned().unwrap_or(Value::Null),
            "nickName": pick("nickName", login.nick_name.as_deref()),
            "user_name": pick("nickName", login.nick_name.as_deref()),
            "realName": pick("realName", login.real_name.as_deref()),
            "username": pick("username", Some(&login.username)),
            "user_id": pick("username", Some(&login.user_id)),
            "uid": pick("uid", login.uid.as_deref()),
            "appCode": pick("appCode", login.app_code.as_deref()),
            "provinceId": info.get("provinceId").cloned().unwrap_or(Value::Null),
            "createTime": info.get("createTime").cloned().unwrap_or(Value::Null),
            "email": info.get("email").cloned().unwrap_or(Value::Null),
        });
        if let Some(ext) = info.get("userInfoExtendVo").filter(|v| !v.is_null()) {
            agg["userInfoExtendVo"] = ext.clone();
        }
        if let Some(obj) = agg.as_object_mut() {
            obj.retain(|_, v| !v.is_null());
        }

        let ttl = LOGIN_TTL.min(USERINFO_TTL);
        cache_json_set(self.cache.as_ref(), &cache_key, &agg, Some(ttl)).await;
        Ok(select_fields(agg, fields))
    }
}

/// Project an aggregated payload down to the requested fields.
pub fn select_fields(data: Value, fields: Option<&[String]>) -> Value {
    let Some(fields) = fields.filter(|f| !f.is_empty()) else {
        return data;
    };
    let mut out = serde_json::Map::new();
    for f in fields {
        out.insert(f.clone(), data.get(f).cloned().unwrap_or(Value::Null));
    }
    Value::Object(out)
}
