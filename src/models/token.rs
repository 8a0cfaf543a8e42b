use serde::{Deserialize, Serialize};

/// Reverse-lookup record stored under `token_index:{token}`.
///
/// A token maps to exactly one `(userid, uid)` pair for its cached lifetime.
/// `uid` is the upstream's own identity id and may be absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenIndexEntry {
    pub userid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// Normalized result of a successful upstream login.
///
/// Field names follow the upstream payload so the cached JSON round-trips
/// into the compatibility responses unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoginResult {
    pub token: String,
    #[serde(default)]
    pub head_img: String,
    #[serde(default)]
    pub phone: String,
    #[serde(rename = "joinUnitTime", skip_serializing_if = "Option::is_none")]
    pub join_unit_time: Option<i64>,
    #[serde(rename = "cityId", skip_serializing_if = "Option::is_none")]
    pub city_id: Option<String>,
    #[serde(rename = "accountId", skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(rename = "nickName", skip_serializing_if = "Option::is_none")]
    pub nick_name: Option<String>,
    #[serde(rename = "realName", skip_serializing_if = "Option::is_none")]
    pub real_name: Option<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(rename = "appCode", skip_serializing_if = "Option::is_none")]
    pub app_code: Option<String>,
}
