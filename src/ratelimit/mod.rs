//! Token bucket rate limiting over a shared store.

pub mod bucket;
mod engine;
mod limits;
mod outcome;
pub mod script;

pub use bucket::BucketState;
pub use engine::RateLimitEngine;
pub use limits::{LimitSpec, LimitTable, LimitType, RateLimitConfig};
pub use outcome::{Decision, LimitStatus, RateLimitError};
pub use script::{ScriptCache, TOKEN_BUCKET_SCRIPT};
