//! HTTP surface, shared state and the background renewal loop.

pub mod metrics;
pub mod renew;
pub mod router;
pub mod state;

pub use metrics::RequestStats;
pub use renew::{renew_sweep, token_renew_job};
pub use router::build_router;
pub use state::{AppState, InflightGuard, InflightSet};
