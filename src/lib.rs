//! Tokenwarden: token bucket rate limiting over a shared atomic store.
//!
//! Every check runs as one script invocation inside the store, so any number
//! of service instances can enforce the same limits without coordinating.
//!
//! # Architecture
//!
//! - **store**: the [`SharedStore`](store::SharedStore) seam, with Redis and
//!   in-process implementations
//! - **ratelimit**: limit table, token bucket routine, script cache and the
//!   [`RateLimitEngine`](ratelimit::RateLimitEngine)
//! - **gateway**: IP and identifier helpers returning `{limited, error}`
//! - **http**: the `POST /rate-limit` API, IP middleware and a remote client
//! - **config**: service configuration from YAML and the environment

pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod ratelimit;
pub mod store;

pub use error::{Result, WardenError};
