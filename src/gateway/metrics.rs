//! Service metrics: account and cache-entry counts plus a 24 h ring of
//! per-minute request buckets.

use std::sync::Mutex;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use axum::Json;
use serde_json::{json, Value};

use super::state::AppState;
use crate::error::AppError;

const MINUTES_PER_DAY: usize = 1440;

struct BucketRing {
    buckets: [u32; MINUTES_PER_DAY],
    last_minute: Option<i64>,
}

/// Per-minute request counters covering the last 24 hours. Buckets are
/// zeroed lazily as the clock rolls past them.
pub struct RequestStats {
    ring: Mutex<BucketRing>,
}

impl Default for RequestStats {
    fn default() -> Self {
        Self {
            ring: Mutex::new(BucketRing {
                buckets: [0; MINUTES_PER_DAY],
                last_minute: None,
            }),
        }
    }
}

impl RequestStats {
    pub fn record(&self) {
        self.record_at(chrono::Utc::now().timestamp());
    }

    fn record_at(&self, epoch_secs: i64) {
        let minute = epoch_secs.div_euclid(60);
        let mut ring = self.ring.lock().unwrap_or_else(|p| p.into_inner());
        ring.roll_to(minute);
        let idx = minute.rem_euclid(MINUTES_PER_DAY as i64) as usize;
        ring.buckets[idx] += 1;
    }

    /// `(last 24 h, last 5 min)` request totals.
    pub fn window_counts(&self) -> (u64, u64) {
        self.window_counts_at(chrono::Utc::now().timestamp())
    }

    fn window_counts_at(&self, epoch_secs: i64) -> (u64, u64) {
        let minute = epoch_secs.div_euclid(60);
        let mut ring = self.ring.lock().unwrap_or_else(|p| p.into_inner());
        ring.roll_to(minute);
        let day: u64 = ring.buckets.iter().map(|&n| u64::from(n)).sum();
        let recent: u64 = (0..5)
            .map(|i| {
                let idx = (minute - i).rem_euclid(MINUTES_PER_DAY as i64) as usize;
                u64::from(ring.buckets[idx])
            })
            .sum();
        (day, recent)
    }
}

impl BucketRing {
    /// Zero every bucket the clock has passed since the last touch.
    fn roll_to(&mut self, minute: i64) {
        let last = match self.last_minute {
            Some(last) => last,
            None => {
                self.last_minute = Some(minute);
                return;
            }
        };
        if minute <= last {
            return;
        }
        if minute - last >= MINUTES_PER_DAY as i64 {
            self.buckets = [0; MINUTES_PER_DAY];
        } else {
            for m in (last + 1)..=minute {
                self.buckets[m.rem_euclid(MINUTES_PER_DAY as i64) as usize] = 0;
            }
        }
        self.last_minute = Some(minute);
    }
}

/// Counts every inbound request into the minute ring.
pub async fn track_requests(State(state): State<AppState>, req: Request, next: Next) -> Response {
    state.stats.record();
    next.run(req).await
}

pub async fn metrics(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let users = state.users.load().await?;
    let cached_logins = state.cache.count_with_prefix("login:").await;
    let active_tokens = state.cache.count_with_prefix("token_by_user:").await;
    let (requests_24h, requests_5m) = state.stats.window_counts();
    Ok(Json(json!({
        "message": "success",
        "statusCode": "200",
        "data": {
            "service": {
                "running": true,
                "address": "127.0.0.1",
                "port": state.config.port,
            },
            "accounts_total": users.len(),
            "cached_logins": cached_logins,
            "active_tokens": active_tokens,
            "invalid_tokens": 0,
            "requests_24h": requests_24h,
            "requests_5m": requests_5m,
            "updated_at": chrono::Local::now().format("%H:%M:%S").to_string(),
        }
    })))
}
