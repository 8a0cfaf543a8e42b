use serde::{Deserialize, Serialize};

/// Persisted profile for one stored account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserRecord {
    pub userid: String,
    pub password: String,
    /// Upstream logins use the phone when present, the userid otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default)]
    pub user_nickname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_realname: Option<String>,
    #[serde(default)]
    pub head_img: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pt_timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Cleared by the bad-credential policy; inactive accounts are skipped
    /// by automated login paths.
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl UserRecord {
    pub fn new(userid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            userid: userid.into(),
            password: password.into(),
            phone: None,
            user_nickname: String::new(),
            user_realname: None,
            head_img: String::new(),
            pt_timestamp: None,
            user_id: None,
            active: true,
        }
    }
}

/// Plain account-save request from the desktop client.
#[derive(Debug, Clone, Deserialize)]
pub struct SaveUserBody {
    pub userid: String,
    pub password: String,
    pub user_name: String,
    #[serde(default)]
    pub head_img: String,
}

/// App-shaped save request carrying a live session snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct AppSaveDataBody {
    pub pt_appid: String,
    pub pt_type: String,
    #[serde(default)]
    pub pt_sysicourl: Vec<String>,
    pub pt_userid: String,
    pub pt_token: String,
    #[serde(default)]
    pub pt_nickname: Option<String>,
    pub pt_username: String,
    #[serde(default)]
    pub pt_photourl: Option<String>,
    pub pt_timestamp: i64,
    #[serde(default)]
    pub pt_session: Option<String>,
}

/// The two request shapes the save endpoint accepts, discriminated by
/// field set rather than runtime inspection.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SaveDataBody {
    User(SaveUserBody),
    App(AppSaveDataBody),
}

/// Aggregated user-info request.
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfoRequest {
    pub user_id: String,
    pub password: String,
    #[serde(default)]
    pub fields: Option<Vec<String>>,
}
