use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use tracing::{trace, warn};

use super::login::{trace_id, AuthService};
use crate::cache::cache_json_get;
use crate::constants::{mask_token, TOKEN_INVALID_CODE};
use crate::models::TokenIndexEntry;
use crate::upstream::RequestOptions;

impl AuthService {
    /// Upstream introspection request. Any failure reads as an empty object.
    async fn exchange_token(&self, token: &str, opts: RequestOptions) -> serde_json::Value {
        let url = format!(
            "{}/seewo-account/api/v1/auth/{}/exchange",
            self.cfg.account_base, token
        );
        let mut headers = HeaderMap::new();
        if let Ok(v) = HeaderValue::from_str(&trace_id()) {
            headers.insert("X-APM-TraceId", v);
        }
        headers.insert("x-auth-app", HeaderValue::from_static("EasiNote5"));
        headers.insert("x-auth-brand", HeaderValue::from_static(""));
        if let Ok(v) = HeaderValue::from_str(&chrono::Utc::now().timestamp_millis().to_string())
        {
            headers.insert("x-auth-timestamp", v);
        }
        let cookies = format!(
            "x-auth-app=EasiNote5; x-auth-brand=; client_version=5.2.4.8615; \
             client_build_version=108615; client_flags=tabs; pt_token={}",
            token
        );

        let resp = match self
            .upstream
            .request_with_retry(
                Method::GET,
                &url,
                headers,
                Some(cookies),
                None,
                opts,
            )
            .await
        {
            Ok(resp) => resp,
            Err(_) => return serde_json::json!({}),
        };
        let data = resp
            .json::<serde_json::Value>()
            .await
            .unwrap_or_else(|_| serde_json::json!({}));
        trace!("Exchange response: {}", data);
        data
    }

    /// True only when the upstream authoritatively reports the token
    /// invalid. Transport failures and unexpected shapes fail open: a
    /// flaky upstream must never evict a good session.
    pub async fn is_token_invalid(&self, token: &str) -> bool {
        self.check_token_invalid(token, RequestOptions::default())
            .await
    }

    /// Single-attempt variant for latency-sensitive request paths; the
    /// same fail-open rule applies.
    pub async fn is_token_invalid_fast(&self, token: &str) -> bool {
        self.check_token_invalid(
            token,
            RequestOptions {
                max_attempts: 1,
                ..RequestOptions::default()
            },
        )
        .await
    }

    async fn check_token_invalid(&self, token: &str, opts: RequestOptions) -> bool {
        let data = self.exchange_token(token, opts).await;
        let code = data.get("statusCode").and_then(|v| v.as_i64());
        if code == Some(TOKEN_INVALID_CODE) {
            let uid = cache_json_get::<TokenIndexEntry>(
                self.cache.as_ref(),
                &format!("token_index:{}", token),
            )
            .await
            .and_then(|idx| idx.uid);
            warn!(
                "Token reported expired: uid({}) code({})",
                uid.as_deref().unwrap_or("unknown"),
                TOKEN_INVALID_CODE
            );
            trace!("Exchange response for {}: {}", mask_token(token), data);
            return true;
        }
        false
    }
}
