//! HTTP surface: the rate limit API, edge middleware and a remote client.

mod client;
mod middleware;
mod server;
mod service;
mod wire;

pub use client::RateLimitClient;
pub use middleware::{ip_rate_limit, IpLimitState};
pub use server::HttpServer;
pub use service::router;
