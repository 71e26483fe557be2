//! Core rate limit engine.

use std::sync::Arc;
use tracing::{error, trace, warn};

use super::bucket::BucketParams;
use super::limits::{LimitTable, RateLimitConfig};
use super::outcome::{Decision, RateLimitError};
use super::script::{encode_args, ScriptCache};
use crate::clock::{Clock, SystemClock};
use crate::store::{SharedStore, StoreError};

/// Checks and consumes token bucket capacity in a shared store.
///
/// The engine holds no bucket state itself: every check is one invocation of
/// the token bucket routine in the store, so any number of engines may share
/// a store.
pub struct RateLimitEngine {
    store: Arc<dyn SharedStore>,
    scripts: Arc<ScriptCache>,
    limits: Arc<LimitTable>,
    clock: Arc<dyn Clock>,
}

impl RateLimitEngine {
    /// Create an engine over `store` using the system clock.
    pub fn new(store: Arc<dyn SharedStore>, limits: LimitTable) -> Self {
        Self {
            store,
            scripts: Arc::new(ScriptCache::token_bucket()),
            limits: Arc::new(limits),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Share a script cache with other engines on the same store.
    pub fn with_script_cache(mut self, scripts: Arc<ScriptCache>) -> Self {
        self.scripts = scripts;
        self
    }

    pub fn limits(&self) -> &LimitTable {
        &self.limits
    }

    pub fn scripts(&self) -> &ScriptCache {
        &self.scripts
    }

    /// Check and consume one token for `identifier` under `limit_type`.
    pub async fn check(
        &self,
        identifier: &str,
        limit_type: &str,
    ) -> Result<Decision, RateLimitError> {
        self.check_tokens(identifier, limit_type, 1).await
    }

    /// Check and consume `tokens` for `identifier` under `limit_type`.
    ///
    /// Unknown limit types and malformed input are rejected before the store
    /// is contacted. Store failures are reported as
    /// [`RateLimitError::Infra`]; callers must treat them as a denial.
    pub async fn check_tokens(
        &self,
        identifier: &str,
        limit_type: &str,
        tokens: u32,
    ) -> Result<Decision, RateLimitError> {
        let config = self.limits.get(limit_type).ok_or_else(|| {
            error!(limit_type = %limit_type, "Invalid limit type specified");
            RateLimitError::UnknownLimitType(limit_type.to_string())
        })?;

        if identifier.is_empty() {
            return Err(RateLimitError::InvalidRequest(
                "identifier must not be empty".to_string(),
            ));
        }
        if tokens == 0 {
            return Err(RateLimitError::InvalidRequest(
                "tokens to consume must be at least 1".to_string(),
            ));
        }

        let key = config.key_for(identifier);
        trace!(key = %key, tokens, "Checking rate limit");

        match self.consume(&key, config, tokens).await {
            Ok(true) => Ok(Decision::Allowed),
            Ok(false) => {
                warn!(
                    identifier = %identifier,
                    limit_type = %limit_type,
                    "Denied request, rate limit exceeded"
                );
                Ok(Decision::Denied)
            }
            Err(e) => {
                error!(
                    identifier = %identifier,
                    limit_type = %limit_type,
                    error = %e,
                    "Error checking rate limit"
                );
                Err(RateLimitError::Infra(e))
            }
        }
    }

    /// Check that the shared store is reachable.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.store.ping().await
    }

    /// Run the token bucket routine, reloading it once if the store lost it.
    async fn consume(
        &self,
        key: &str,
        config: &RateLimitConfig,
        tokens: u32,
    ) -> Result<bool, StoreError> {
        let mut reloaded = false;

        loop {
            let handle = self.scripts.ensure_loaded(self.store.as_ref()).await?;
            let params = BucketParams {
                capacity: config.capacity,
                refill_rate: config.refill_rate,
                now: self.clock.now_secs(),
                requested: f64::from(tokens),
            };

            match self
                .store
                .eval_script(&handle, &[key], &encode_args(&params))
                .await
            {
                Ok(1) => return Ok(true),
                Ok(0) => return Ok(false),
                Ok(other) => {
                    return Err(StoreError::Rejected(format!(
                        "unexpected rate limiter reply: {}",
                        other
                    )))
                }
                Err(e) if e.is_script_not_found() && !reloaded => {
                    warn!(handle = %handle, "Rate limiter script not found in store, reloading");
                    self.scripts.invalidate(&handle);
                    reloaded = true;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::limits::LimitType;
    use crate::store::{MemoryStore, ScriptHandle};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    const NOW: u64 = 1_700_000_000;

    fn memory_engine() -> (RateLimitEngine, Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(NOW));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let engine =
            RateLimitEngine::new(store.clone(), LimitTable::builtin()).with_clock(clock.clone());
        (engine, store, clock)
    }

    /// Store double that reports "script not found" for the first
    /// `missing_evals` invocations, then allows everything.
    struct ForgetfulStore {
        missing_evals: u32,
        loads: AtomicU32,
        evals: AtomicU32,
    }

    impl ForgetfulStore {
        fn new(missing_evals: u32) -> Self {
            Self {
                missing_evals,
                loads: AtomicU32::new(0),
                evals: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl SharedStore for ForgetfulStore {
        async fn load_script(&self, _body: &str) -> Result<ScriptHandle, StoreError> {
            let n = self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(ScriptHandle::new(format!("handle-{}", n)))
        }

        async fn eval_script(
            &self,
            handle: &ScriptHandle,
            _keys: &[&str],
            _args: &[String],
        ) -> Result<i64, StoreError> {
            let n = self.evals.fetch_add(1, Ordering::SeqCst);
            if n < self.missing_evals {
                Err(StoreError::ScriptNotFound(handle.to_string()))
            } else {
                Ok(1)
            }
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    struct DownStore;

    #[async_trait]
    impl SharedStore for DownStore {
        async fn load_script(&self, _body: &str) -> Result<ScriptHandle, StoreError> {
            Ok(ScriptHandle::new("handle"))
        }

        async fn eval_script(
            &self,
            _handle: &ScriptHandle,
            _keys: &[&str],
            _args: &[String],
        ) -> Result<i64, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_first_check_initializes_bucket() {
        let (engine, store, _) = memory_engine();

        let decision = engine.check("alice", "SENSITIVE_IDENTIFIER").await.unwrap();

        assert_eq!(decision, Decision::Allowed);
        let state = store.bucket("rl:id:alice").unwrap();
        assert_eq!(state.tokens, 4.0);
        assert_eq!(state.last_refill, NOW);
    }

    #[tokio::test]
    async fn test_sixth_sensitive_check_is_denied() {
        let (engine, _, _) = memory_engine();

        for i in 1..=5 {
            let decision = engine.check("bob", "SENSITIVE_IDENTIFIER").await.unwrap();
            assert_eq!(decision, Decision::Allowed, "check {} should be allowed", i);
        }

        let decision = engine.check("bob", "SENSITIVE_IDENTIFIER").await.unwrap();
        assert_eq!(decision, Decision::Denied);
    }

    #[tokio::test]
    async fn test_refill_restores_one_token_per_minute() {
        let (engine, _, clock) = memory_engine();
        let limit = LimitType::SensitiveIdentifier.as_str();

        for _ in 0..5 {
            engine.check("carol", limit).await.unwrap();
        }
        assert_eq!(engine.check("carol", limit).await.unwrap(), Decision::Denied);

        clock.advance(60);
        assert_eq!(engine.check("carol", limit).await.unwrap(), Decision::Allowed);
        assert_eq!(engine.check("carol", limit).await.unwrap(), Decision::Denied);
    }

    #[tokio::test]
    async fn test_identifiers_and_limit_types_are_independent() {
        let (engine, _, _) = memory_engine();

        for _ in 0..5 {
            engine.check("dave", "SENSITIVE_IDENTIFIER").await.unwrap();
        }

        assert_eq!(
            engine.check("dave", "SENSITIVE_IDENTIFIER").await.unwrap(),
            Decision::Denied
        );
        assert_eq!(
            engine.check("erin", "SENSITIVE_IDENTIFIER").await.unwrap(),
            Decision::Allowed
        );
        assert_eq!(
            engine.check("dave", "API_HEAVY_ENDPOINT").await.unwrap(),
            Decision::Allowed
        );
    }

    #[tokio::test]
    async fn test_multi_token_check() {
        let (engine, store, _) = memory_engine();

        let decision = engine
            .check_tokens("frank", "API_HEAVY_ENDPOINT", 15)
            .await
            .unwrap();
        assert_eq!(decision, Decision::Allowed);
        assert_eq!(store.bucket("rl:api_heavy:frank").unwrap().tokens, 5.0);

        let decision = engine
            .check_tokens("frank", "API_HEAVY_ENDPOINT", 6)
            .await
            .unwrap();
        assert_eq!(decision, Decision::Denied);
        assert_eq!(store.bucket("rl:api_heavy:frank").unwrap().tokens, 5.0);
    }

    #[tokio::test]
    async fn test_unknown_limit_type_skips_store() {
        let (engine, store, _) = memory_engine();

        let err = engine.check("alice", "NOT_A_TYPE").await.unwrap_err();

        assert_eq!(err, RateLimitError::UnknownLimitType("NOT_A_TYPE".to_string()));
        assert!(err.is_config());
        assert_eq!(store.script_load_count(), 0);
        assert_eq!(store.eval_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_input_skips_store() {
        let (engine, store, _) = memory_engine();

        let err = engine.check("", "GENERAL_IP").await.unwrap_err();
        assert!(matches!(err, RateLimitError::InvalidRequest(_)));

        let err = engine
            .check_tokens("alice", "GENERAL_IP", 0)
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::InvalidRequest(_)));

        assert_eq!(store.eval_count(), 0);
    }

    #[tokio::test]
    async fn test_reloads_after_store_flush() {
        let (engine, store, _) = memory_engine();

        engine.check("gina", "GENERAL_IP").await.unwrap();
        let first = engine.scripts().cached().unwrap();

        store.flush_scripts();
        let decision = engine.check("gina", "GENERAL_IP").await.unwrap();

        assert_eq!(decision, Decision::Allowed);
        assert_eq!(store.script_load_count(), 2);
        assert_eq!(engine.scripts().cached(), Some(first));
        assert_eq!(store.bucket("rl:ip:gina").unwrap().tokens, 98.0);
    }

    #[tokio::test]
    async fn test_single_missing_script_is_retried_once() {
        let store = Arc::new(ForgetfulStore::new(1));
        let engine = RateLimitEngine::new(store.clone(), LimitTable::builtin());

        let decision = engine.check("henry", "GENERAL_IP").await.unwrap();

        assert_eq!(decision, Decision::Allowed);
        assert_eq!(store.loads.load(Ordering::SeqCst), 2);
        assert_eq!(store.evals.load(Ordering::SeqCst), 2);
        assert_eq!(
            engine.scripts().cached(),
            Some(ScriptHandle::new("handle-1"))
        );
    }

    #[tokio::test]
    async fn test_repeated_missing_script_is_infra_error() {
        let store = Arc::new(ForgetfulStore::new(2));
        let engine = RateLimitEngine::new(store.clone(), LimitTable::builtin());

        let err = engine.check("ivan", "GENERAL_IP").await.unwrap_err();

        assert!(err.is_infra());
        assert!(matches!(
            err,
            RateLimitError::Infra(StoreError::ScriptNotFound(_))
        ));
        assert_eq!(store.loads.load(Ordering::SeqCst), 2);
        assert_eq!(store.evals.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_store_failure_fails_closed() {
        let engine = RateLimitEngine::new(Arc::new(DownStore), LimitTable::builtin());

        let err = engine.check("judy", "GENERAL_IP").await.unwrap_err();
        assert_eq!(
            err,
            RateLimitError::Infra(StoreError::Unavailable("connection refused".to_string()))
        );
        assert!(engine.ping().await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_never_overdraw() {
        let clock = Arc::new(ManualClock::new(NOW));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let limits = LimitTable::builtin()
            .with_limit(
                "BURST_TEN",
                RateLimitConfig::new("rl:burst", 10.0, 60),
            )
            .unwrap();
        let engine = Arc::new(RateLimitEngine::new(store, limits).with_clock(clock));

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.check("kate", "BURST_TEN").await })
            })
            .collect();

        let mut allowed = 0;
        let mut denied = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                Decision::Allowed => allowed += 1,
                Decision::Denied => denied += 1,
            }
        }

        assert_eq!(allowed, 10);
        assert_eq!(denied, 10);
    }
}
