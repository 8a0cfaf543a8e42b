use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::constants;

/// Application configuration, persisted as `appsettings.json` in the data
/// directory. Missing fields fall back to defaults; a missing file is
/// created with the defaults written back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Auto-disable accounts after repeated invalid-credential failures.
    #[serde(default)]
    pub disable_on_bad_credentials: bool,
    #[serde(default = "default_bad_credential_threshold")]
    pub bad_credential_threshold: u32,
    /// Capacity bound of the in-memory cache variant.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_fail_threshold")]
    pub fail_threshold: u32,
    #[serde(default = "default_reset_timeout")]
    pub reset_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the account/introspection host.
    #[serde(default = "default_account_base")]
    pub account_base: String,
    /// Base URL of the login / user-info host.
    #[serde(default = "default_edu_base")]
    pub edu_base: String,
}

fn default_port() -> u16 {
    24300
}
fn default_token_ttl() -> u64 {
    constants::TOKEN_TTL.as_secs()
}
fn default_check_interval() -> u64 {
    constants::CHECK_INTERVAL.as_secs()
}
fn default_bad_credential_threshold() -> u32 {
    3
}
fn default_cache_capacity() -> usize {
    4096
}
fn default_fail_threshold() -> u32 {
    constants::FAIL_THRESHOLD
}
fn default_reset_timeout() -> u64 {
    constants::RESET_TIMEOUT.as_secs()
}
fn default_account_base() -> String {
    "https://account.seewo.com".to_string()
}
fn default_edu_base() -> String {
    "https://edu.seewo.com".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            token_ttl_secs: default_token_ttl(),
            check_interval_secs: default_check_interval(),
            breaker: BreakerConfig::default(),
            disable_on_bad_credentials: false,
            bad_credential_threshold: default_bad_credential_threshold(),
            cache_capacity: default_cache_capacity(),
            upstream: UpstreamConfig::default(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            fail_threshold: default_fail_threshold(),
            reset_timeout_secs: default_reset_timeout(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            account_base: default_account_base(),
            edu_base: default_edu_base(),
        }
    }
}

impl AppConfig {
    pub fn settings_path(data_dir: &Path) -> PathBuf {
        data_dir.join("appsettings.json")
    }

    /// Load from the data directory, writing defaults back on first run.
    /// A corrupt file falls back to defaults without overwriting it.
    pub fn load(data_dir: &Path) -> Self {
        let path = Self::settings_path(data_dir);
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<AppConfig>(&raw) {
                Ok(cfg) => cfg,
                Err(e) => {
                    error!("Failed to parse {}: {}", path.display(), e);
                    AppConfig::default()
                }
            },
            Err(_) => {
                let cfg = AppConfig::default();
                if let Err(e) = std::fs::create_dir_all(data_dir).and_then(|_| {
                    std::fs::write(
                        &path,
                        serde_json::to_string_pretty(&cfg).unwrap_or_default(),
                    )
                }) {
                    error!("Failed to write default settings: {}", e);
                }
                cfg
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.port, 24300);
        assert_eq!(cfg.token_ttl_secs, 600);
        assert_eq!(cfg.check_interval_secs, 30);
        assert_eq!(cfg.breaker.fail_threshold, 3);
        assert_eq!(cfg.breaker.reset_timeout_secs, 10);
        assert!(!cfg.disable_on_bad_credentials);
    }

    #[test]
    fn test_partial_file_merges_defaults() {
        let cfg: AppConfig = serde_json::from_str(r#"{"port": 9000}"#).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.token_ttl_secs, 600);
        assert_eq!(cfg.upstream.edu_base, "https://edu.seewo.com");
    }

    #[test]
    fn test_load_writes_defaults_back() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AppConfig::load(dir.path());
        assert_eq!(cfg.port, 24300);
        assert!(AppConfig::settings_path(dir.path()).exists());
    }
}
