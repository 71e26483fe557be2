//! In-process shared store for single-instance deployments and tests.
//!
//! Buckets live in a sharded map. A routine runs while holding the shard lock
//! of its key, which makes each invocation atomic with respect to every other
//! invocation on the same key.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{ScriptHandle, SharedStore, StoreError};
use crate::clock::{Clock, SystemClock};
use crate::ratelimit::bucket::{self, BucketState};
use crate::ratelimit::script::{decode_args, TOKEN_BUCKET_SCRIPT};

/// Routines this store knows how to execute natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Routine {
    TokenBucket,
}

impl Routine {
    fn for_body(body: &str) -> Option<Self> {
        (body == TOKEN_BUCKET_SCRIPT).then_some(Routine::TokenBucket)
    }
}

#[derive(Debug, Clone, Copy)]
struct StoredBucket {
    state: BucketState,
    expires_at: u64,
}

/// A [`SharedStore`] held entirely in process memory.
pub struct MemoryStore {
    buckets: DashMap<String, StoredBucket>,
    scripts: DashMap<String, Routine>,
    clock: Arc<dyn Clock>,
    script_loads: AtomicU64,
    evals: AtomicU64,
}

impl MemoryStore {
    /// Create a store using the system clock for expiry.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store whose key expiry follows `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::new(),
            scripts: DashMap::new(),
            clock,
            script_loads: AtomicU64::new(0),
            evals: AtomicU64::new(0),
        }
    }

    fn content_hash(body: &str) -> String {
        hex::encode(Sha256::digest(body.as_bytes()))
    }

    /// Forget every loaded routine, as a restarted store would.
    pub fn flush_scripts(&self) {
        self.scripts.clear();
        debug!("Flushed in-memory script cache");
    }

    /// Current state of a bucket, if present and not expired.
    pub fn bucket(&self, key: &str) -> Option<BucketState> {
        let now = self.clock.now_secs();
        self.buckets
            .get(key)
            .filter(|stored| stored.expires_at > now)
            .map(|stored| stored.state)
    }

    /// Seconds until `key` expires, if present and not expired.
    pub fn ttl(&self, key: &str) -> Option<u64> {
        let now = self.clock.now_secs();
        self.buckets
            .get(key)
            .filter(|stored| stored.expires_at > now)
            .map(|stored| stored.expires_at - now)
    }

    /// Number of stored buckets, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Number of routine loads served so far.
    pub fn script_load_count(&self) -> u64 {
        self.script_loads.load(Ordering::SeqCst)
    }

    /// Number of routine invocations served so far.
    pub fn eval_count(&self) -> u64 {
        self.evals.load(Ordering::SeqCst)
    }

    /// Drop expired buckets; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_secs();
        let before = self.buckets.len();
        self.buckets.retain(|_, stored| stored.expires_at > now);
        before.saturating_sub(self.buckets.len())
    }

    /// Periodically purge expired buckets until the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(purged, remaining = store.len(), "Purged expired buckets");
                }
            }
        })
    }

    fn run_token_bucket(&self, key: &str, args: &[String]) -> Result<i64, StoreError> {
        let params = decode_args(args).map_err(StoreError::Rejected)?;
        let now = self.clock.now_secs();
        let expires_at =
            now.saturating_add(bucket::expiry_seconds(params.capacity, params.refill_rate));

        let allowed = match self.buckets.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                let state = (current.expires_at > now).then_some(current.state);
                let (state, allowed) = bucket::consume(state, &params);
                occupied.insert(StoredBucket {
                    state,
                    expires_at,
                });
                allowed
            }
            Entry::Vacant(vacant) => {
                let (state, allowed) = bucket::consume(None, &params);
                vacant.insert(StoredBucket {
                    state,
                    expires_at,
                });
                allowed
            }
        };

        trace!(key = %key, allowed, "Ran token bucket routine");
        Ok(i64::from(allowed))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn load_script(&self, body: &str) -> Result<ScriptHandle, StoreError> {
        let routine = Routine::for_body(body).ok_or_else(|| {
            StoreError::Rejected("in-memory store cannot execute this script".to_string())
        })?;

        let hash = Self::content_hash(body);
        self.scripts.insert(hash.clone(), routine);
        self.script_loads.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptHandle::new(hash))
    }

    async fn eval_script(
        &self,
        handle: &ScriptHandle,
        keys: &[&str],
        args: &[String],
    ) -> Result<i64, StoreError> {
        self.evals.fetch_add(1, Ordering::SeqCst);

        let routine = self
            .scripts
            .get(handle.as_str())
            .map(|r| *r)
            .ok_or_else(|| StoreError::ScriptNotFound(handle.to_string()))?;

        let [key] = keys else {
            return Err(StoreError::Rejected(format!(
                "expected exactly one key, got {}",
                keys.len()
            )));
        };

        match routine {
            Routine::TokenBucket => self.run_token_bucket(key, args),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
