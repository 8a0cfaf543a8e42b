//! Credential broker and session cache in front of the Seewo SSO upstream.
//!
//! The desktop client talks to the compatibility surface in
//! [`gateway::router`]; tokens are cached and indexed three ways
//! (`token_by_user`, `token_by_uid`, `token_index`), revalidated by a
//! background sweep, and every upstream call goes through a per-host
//! circuit breaker with retries.

pub mod auth;
pub mod cache;
pub mod constants;
pub mod error;
pub mod gateway;
pub mod models;
pub mod store;
pub mod upstream;
