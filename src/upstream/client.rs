//! Outbound HTTP with per-host circuit breaking and retry.
//!
//! Breaker state is owned by the client instance and injected wherever
//! upstream calls are made; it is never persisted and resets on restart.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, COOKIE};
use reqwest::Method;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::constants::{BACKOFF_BASE, HTTP_SERVER_ERROR};
use crate::error::{AppError, AppResult};
use crate::models::BreakerConfig;

#[derive(Debug, Clone, Copy)]
struct BreakerState {
    fail: u32,
    opened_at: Option<Instant>,
    open: bool,
    half_open: bool,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            fail: 0,
            opened_at: None,
            open: false,
            half_open: false,
        }
    }
}

/// Per-request knobs; defaults match the reference behavior.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: BACKOFF_BASE,
        }
    }
}

pub struct UpstreamClient {
    http: reqwest::Client,
    breaker: Mutex<HashMap<String, BreakerState>>,
    fail_threshold: u32,
    reset_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(cfg: &BreakerConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(1))
            .timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(32)
            .build()?;
        Ok(Self {
            http,
            breaker: Mutex::new(HashMap::new()),
            fail_threshold: cfg.fail_threshold.max(1),
            reset_timeout: Duration::from_secs(cfg.reset_timeout_secs),
        })
    }

    fn host_from_url(url: &str) -> String {
        url.split('/').nth(2).unwrap_or_default().to_string()
    }

    /// Open and still inside the reset window blocks the call. Past the
    /// window the breaker flips to half-open and lets callers through;
    /// the outcome of those trial calls decides whether it closes.
    fn should_block(&self, host: &str) -> bool {
        let mut map = self.breaker.lock().unwrap_or_else(|p| p.into_inner());
        let st = map.entry(host.to_string()).or_insert_with(BreakerState::closed);
        if !st.open {
            return false;
        }
        let elapsed = st
            .opened_at
            .map(|t| t.elapsed())
            .unwrap_or(Duration::MAX);
        if elapsed < self.reset_timeout {
            return true;
        }
        st.open = false;
        st.half_open = true;
        false
    }

    fn record_success(&self, host: &str) {
        let mut map = self.breaker.lock().unwrap_or_else(|p| p.into_inner());
        map.insert(host.to_string(), BreakerState::closed());
    }

    fn record_failure(&self, host: &str) {
        let mut map = self.breaker.lock().unwrap_or_else(|p| p.into_inner());
        let st = map.entry(host.to_string()).or_insert_with(BreakerState::closed);
        st.fail += 1;
        if st.fail >= self.fail_threshold {
            st.open = true;
            st.opened_at = Some(Instant::now());
            st.half_open = false;
        }
    }

    /// Retrying request through the breaker.
    ///
    /// A transport error or a server-error status counts as a failure:
    /// the host's counter is bumped and the attempt retried after
    /// `backoff_base * 2^attempt`. Any success resets the host's breaker.
    /// An open breaker fails immediately with `CircuitOpen`, without a
    /// network call; exhausting attempts yields `RequestFailed`.
    pub async fn request_with_retry(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        cookies: Option<String>,
        json: Option<&serde_json::Value>,
        opts: RequestOptions,
    ) -> AppResult<reqwest::Response> {
        let host = Self::host_from_url(url);
        for attempt in 0..opts.max_attempts {
            if self.should_block(&host) {
                debug!("Breaker open for {}, short-circuiting", host);
                return Err(AppError::CircuitOpen);
            }
            let mut req = self.http.request(method.clone(), url).headers(headers.clone());
            if let Some(ref cookie) = cookies {
                if let Ok(v) = HeaderValue::from_str(cookie) {
                    req = req.header(COOKIE, v);
                }
            }
            if let Some(body) = json {
                req = req.json(body);
            }
            match req.send().await {
                Ok(resp) if resp.status().as_u16() < HTTP_SERVER_ERROR => {
                    self.record_success(&host);
                    return Ok(resp);
                }
                Ok(resp) => {
                    warn!(
                        "Upstream {} returned {} (attempt {}/{})",
                        host,
                        resp.status(),
                        attempt + 1,
                        opts.max_attempts
                    );
                    self.record_failure(&host);
                }
                Err(e) => {
                    warn!(
                        "Upstream {} request error (attempt {}/{}): {}",
                        host,
                        attempt + 1,
                        opts.max_attempts,
                        e
                    );
                    self.record_failure(&host);
                }
            }
            tokio::time::sleep(opts.backoff_base * 2u32.pow(attempt)).await;
        }
        Err(AppError::RequestFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(threshold: u32, reset_secs: u64) -> UpstreamClient {
        UpstreamClient::new(&BreakerConfig {
            fail_threshold: threshold,
            reset_timeout_secs: reset_secs,
        })
        .unwrap()
    }

    #[test]
    fn test_host_from_url() {
        assert_eq!(
            UpstreamClient::host_from_url("https://edu.seewo.com/api/v1/auth/login"),
            "edu.seewo.com"
        );
        assert_eq!(UpstreamClient::host_from_url("garbage"), "");
    }

    #[tokio::test]
    async fn test_breaker_opens_at_threshold() {
        let c = client(3, 10);
        c.record_failure("h");
        c.record_failure("h");
        assert!(!c.should_block("h"));
        c.record_failure("h");
        assert!(c.should_block("h"));
    }

    #[tokio::test]
    async fn test_success_resets_breaker() {
        let c = client(3, 10);
        for _ in 0..3 {
            c.record_failure("h");
        }
        assert!(c.should_block("h"));
        c.record_success("h");
        assert!(!c.should_block("h"));
        // Counter restarted from zero.
        c.record_failure("h");
        c.record_failure("h");
        assert!(!c.should_block("h"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_reset_window() {
        let c = client(3, 10);
        for _ in 0..3 {
            c.record_failure("h");
        }
        assert!(c.should_block("h"));

        tokio::time::advance(Duration::from_secs(11)).await;
        // Reset window elapsed: the next check lets a trial through.
        assert!(!c.should_block("h"));

        // A failed trial re-opens with a fresh timer.
        c.record_failure("h");
        assert!(c.should_block("h"));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(c.should_block("h"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_success_closes() {
        let c = client(3, 10);
        for _ in 0..3 {
            c.record_failure("h");
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!c.should_block("h"));
        c.record_success("h");
        assert!(!c.should_block("h"));
    }

    #[tokio::test]
    async fn test_open_breaker_short_circuits_without_network() {
        let c = client(1, 60);
        c.record_failure("127.0.0.1:1");
        let err = c
            .request_with_retry(
                Method::GET,
                "http://127.0.0.1:1/never",
                HeaderMap::new(),
                None,
                None,
                RequestOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::CircuitOpen));
    }

    #[tokio::test]
    async fn test_exhausted_attempts_yield_request_failed() {
        // Unroutable port: every attempt errors at the transport level.
        let c = client(100, 60);
        let err = c
            .request_with_retry(
                Method::GET,
                "http://127.0.0.1:1/unreachable",
                HeaderMap::new(),
                None,
                None,
                RequestOptions {
                    max_attempts: 2,
                    backoff_base: Duration::from_millis(1),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::RequestFailed));
    }
}
