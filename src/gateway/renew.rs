//! Background token renewal.
//!
//! The sweep walks every `token_index:` entry, re-checks each token against
//! the upstream and either re-stamps the three index entries with a fresh
//! TTL or evicts the token entirely. Tokens with a check already in flight
//! are skipped; they will be picked up next round.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::state::AppState;
use crate::cache::cache_json_get;
use crate::models::TokenIndexEntry;

/// Counters for one sweep. There is no failure counter: the validity
/// check fails open and cache-tier errors degrade to misses, so no
/// per-token step here can surface an error.
#[derive(Debug, Default, PartialEq)]
pub struct SweepOutcome {
    pub refreshed: usize,
    pub invalidated: usize,
    pub skipped: usize,
}

/// One pass over the token index. Factored out of the loop so tests can
/// drive a sweep directly.
pub async fn renew_sweep(state: &AppState) -> SweepOutcome {
    let mut outcome = SweepOutcome::default();
    for key in state.cache.keys_with_prefix("token_index:").await {
        let Some(token) = key.strip_prefix("token_index:").filter(|t| !t.is_empty()) else {
            continue;
        };
        let Some(_guard) = state.inflight_tokens.try_mark(token) else {
            outcome.skipped += 1;
            continue;
        };
        if state.auth.is_token_invalid(token).await {
            state.invalidate_token_cache(token).await;
            outcome.invalidated += 1;
            continue;
        }
        // The entry may have expired between the key listing and here.
        let Some(entry) = cache_json_get::<TokenIndexEntry>(state.cache.as_ref(), &key).await
        else {
            continue;
        };
        state
            .write_token_indices(&entry.userid, entry.uid.as_deref(), token)
            .await;
        outcome.refreshed += 1;
    }
    outcome
}

/// Sweep forever, sleeping `check_interval` between rounds. Cancellation
/// is observed at the sleep boundary; an in-progress sweep finishes.
pub async fn token_renew_job(state: AppState, cancel: CancellationToken) {
    let interval = state.check_interval();
    info!("Token renewal loop started, interval {:?}", interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Token renewal loop stopping");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }
        let outcome = renew_sweep(&state).await;
        if outcome.refreshed + outcome.invalidated + outcome.skipped > 0 {
            debug!(
                "Renewal sweep: refreshed={} invalidated={} skipped={}",
                outcome.refreshed, outcome.invalidated, outcome.skipped
            );
        }
    }
}
