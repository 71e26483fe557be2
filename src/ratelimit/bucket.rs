//! Token bucket state and the single-step transition applied on every check.

use serde::{Deserialize, Serialize};

/// Persisted state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Tokens currently available, in `[0, capacity]`
    pub tokens: f64,
    /// Unix time in seconds of the last touch
    pub last_refill: u64,
}

impl BucketState {
    /// A full bucket created at `now`.
    pub fn full(capacity: f64, now: u64) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }
}

/// Parameters of one consume attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketParams {
    pub capacity: f64,
    pub refill_rate: f64,
    pub now: u64,
    pub requested: f64,
}

/// Longest time a full refill may take, in seconds (about 31 years).
pub const MAX_REFILL_SECONDS: u64 = 1_000_000_000;

/// Idle time after which a bucket may be dropped: twice the time a full
/// refill takes, rounded up. Saturates at `u64::MAX` instead of wrapping.
pub fn expiry_seconds(capacity: f64, refill_rate: f64) -> u64 {
    let full_refill = (capacity / refill_rate).ceil();
    if full_refill.is_nan() {
        return u64::MAX;
    }
    (full_refill as u64).saturating_mul(2)
}

/// Apply one check to a bucket.
///
/// Refills for the time elapsed since `last_refill`, stamps the bucket with
/// `now` (also on denial), and draws `requested` tokens if enough are
/// available. Returns the new state and whether the draw succeeded.
pub fn consume(state: Option<BucketState>, params: &BucketParams) -> (BucketState, bool) {
    let state = state.unwrap_or_else(|| BucketState::full(params.capacity, params.now));

    let elapsed = params.now.saturating_sub(state.last_refill) as f64;
    let mut tokens = (state.tokens + elapsed * params.refill_rate).min(params.capacity);

    let allowed = tokens >= params.requested;
    if allowed {
        tokens -= params.requested;
    }

    (
        BucketState {
            tokens,
            last_refill: params.now,
        },
        allowed,
    )
}
