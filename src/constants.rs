//! Nominal TTLs and upstream protocol constants.
//!
//! Every TTL here is a *nominal* value; actual stored expiries go through
//! `cache::ttl_with_jitter` so entries written together never expire together.

use std::time::Duration;

/// Nominal lifetime of the token index entries (`token_by_user`,
/// `token_by_uid`, `token_index`). The renewal sweep extends this.
pub const TOKEN_TTL: Duration = Duration::from_secs(600);

/// Nominal lifetime of a cached login result.
pub const LOGIN_TTL: Duration = Duration::from_secs(120);

/// Nominal lifetime of a cached user-info payload.
pub const USERINFO_TTL: Duration = Duration::from_secs(300);

/// Sleep between renewal sweeps.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Upstream status code that authoritatively marks a token invalid.
/// Every other code, and every transport failure, is "not proven invalid".
pub const TOKEN_INVALID_CODE: i64 = 40105;

/// Consecutive failures before a host's breaker opens.
pub const FAIL_THRESHOLD: u32 = 3;

/// How long an open breaker blocks before allowing a half-open trial.
pub const RESET_TIMEOUT: Duration = Duration::from_secs(10);

/// Base delay of the exponential retry backoff (`base * 2^attempt`).
pub const BACKOFF_BASE: Duration = Duration::from_millis(200);

/// Status codes at or above this count as upstream failures for the breaker.
pub const HTTP_SERVER_ERROR: u16 = 500;

/// Tokens shorter than this are logged as-is instead of masked.
pub const TOKEN_MASK_MIN_LEN: usize = 10;

/// Nominal lifetime of the in-memory mirror in front of the disk tier.
pub const MIRROR_TTL: Duration = Duration::from_secs(60);

/// Nominal lifetime of a negative-cache (known-miss) entry.
pub const NEGATIVE_TTL: Duration = Duration::from_secs(15);

/// Mask a token for logs, keeping just enough to correlate.
pub fn mask_token(token: &str) -> String {
    if token.is_empty() {
        return String::new();
    }
    if token.len() > TOKEN_MASK_MIN_LEN {
        format!("{}...{}", &token[..6], &token[token.len() - 4..])
    } else {
        token.to_string()
    }
}
