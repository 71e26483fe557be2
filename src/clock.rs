//! Time sources for bucket arithmetic.
//!
//! Bucket timestamps are whole seconds since the Unix epoch. The clock is
//! injected so tests can advance time without sleeping.

use std::sync::atomic::{AtomicU64, Ordering};

/// A source of the current time in whole seconds.
pub trait Clock: Send + Sync {
    /// Current Unix time, truncated to seconds.
    fn now_secs(&self) -> u64;
}

/// Wall clock backed by `chrono::Utc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        chrono::Utc::now().timestamp().max(0) as u64
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at `start` seconds.
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Move the clock forward by `secs` seconds.
    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    /// Set the clock to an absolute time.
    pub fn set(&self, secs: u64) {
        self.now.store(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
