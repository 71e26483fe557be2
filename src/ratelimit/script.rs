//! The atomic token bucket routine and the cache of its store handle.

use parking_lot::RwLock;
use tracing::{debug, error, info};

use super::bucket::BucketParams;
use crate::store::{ScriptHandle, SharedStore, StoreError};

/// Token bucket check-and-consume, run by the store as one atomic unit.
///
/// KEYS[1] bucket key; ARGV: capacity, refill rate (tokens/s), now (s),
/// tokens requested. Returns 1 when the tokens were drawn, 0 otherwise.
pub const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])

local data = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(data[1])
local last_refill = tonumber(data[2])

if tokens == nil or last_refill == nil then
    tokens = capacity
    last_refill = now
end

local elapsed = math.max(0, now - last_refill)
tokens = math.min(capacity, tokens + elapsed * refill_rate)

local allowed = 0
if tokens >= requested then
    tokens = tokens - requested
    allowed = 1
end

redis.call('HSET', key, 'tokens', tokens, 'last_refill', now)
redis.call('EXPIRE', key, math.ceil(capacity / refill_rate) * 2)

return allowed
"#;

/// Encode bucket parameters as the routine's ARGV.
pub fn encode_args(params: &BucketParams) -> Vec<String> {
    vec![
        params.capacity.to_string(),
        params.refill_rate.to_string(),
        params.now.to_string(),
        params.requested.to_string(),
    ]
}

/// Decode the routine's ARGV back into bucket parameters.
pub fn decode_args(args: &[String]) -> Result<BucketParams, String> {
    if args.len() != 4 {
        return Err(format!("expected 4 arguments, got {}", args.len()));
    }

    let number = |idx: usize, name: &str| -> Result<f64, String> {
        args[idx]
            .parse::<f64>()
            .map_err(|_| format!("{} is not a number: {:?}", name, args[idx]))
    };

    Ok(BucketParams {
        capacity: number(0, "capacity")?,
        refill_rate: number(1, "refill_rate")?,
        now: number(2, "now")?.max(0.0) as u64,
        requested: number(3, "requested")?,
    })
}

/// Memoizes the store handle of a routine so its body is sent only once.
///
/// The handle is dropped again via [`ScriptCache::invalidate`] when the store
/// reports it no longer knows the routine.
#[derive(Debug)]
pub struct ScriptCache {
    body: &'static str,
    handle: RwLock<Option<ScriptHandle>>,
}

impl ScriptCache {
    pub fn new(body: &'static str) -> Self {
        Self {
            body,
            handle: RwLock::new(None),
        }
    }

    /// Cache for the token bucket routine.
    pub fn token_bucket() -> Self {
        Self::new(TOKEN_BUCKET_SCRIPT)
    }

    /// The memoized handle, if any.
    pub fn cached(&self) -> Option<ScriptHandle> {
        self.handle.read().clone()
    }

    /// Return the memoized handle, loading the routine into `store` first if needed.
    pub async fn ensure_loaded(&self, store: &dyn SharedStore) -> Result<ScriptHandle, StoreError> {
        if let Some(handle) = self.cached() {
            return Ok(handle);
        }

        let handle = store.load_script(self.body).await.map_err(|e| {
            error!(error = %e, "Failed to load rate limiter script");
            e
        })?;

        info!(handle = %handle, "Loaded rate limiter script");
        *self.handle.write() = Some(handle.clone());
        Ok(handle)
    }

    /// Forget `stale` if it is still the memoized handle.
    ///
    /// A concurrent request may already have reloaded the routine; that newer
    /// handle is kept.
    pub fn invalidate(&self, stale: &ScriptHandle) {
        let mut handle = self.handle.write();
        if handle.as_ref() == Some(stale) {
            debug!(handle = %stale, "Dropping stale rate limiter script handle");
            *handle = None;
        }
    }
}

impl Default for ScriptCache {
    fn default() -> Self {
        Self::token_bucket()
    }
}
