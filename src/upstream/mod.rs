pub mod client;

pub use client::{RequestOptions, UpstreamClient};
