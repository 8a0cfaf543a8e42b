//! Upstream credential exchange: login, token introspection, profile fetch.

pub mod login;
pub mod profile;
pub mod validity;

pub use login::AuthService;
