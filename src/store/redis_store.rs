//! Redis-backed shared store.
//!
//! Routines are loaded with `SCRIPT LOAD` and invoked with `EVALSHA`. Redis
//! runs each script to completion before serving another command, which is
//! what makes a bucket check atomic across every service instance.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{ErrorKind, FromRedisValue, RedisError};
use std::time::Duration;
use tracing::{debug, warn};

use super::{ScriptHandle, SharedStore, StoreError};

/// Bounds on how long and how often a store command is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt when the connection fails
    pub max_retries: u32,
    /// Upper bound on the delay between attempts
    pub max_delay: Duration,
    /// Deadline for a single attempt
    pub command_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_delay: Duration::from_millis(2000),
            command_timeout: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): 50ms per attempt, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(50 * u64::from(attempt)).min(self.max_delay)
    }
}

/// Translate a Redis client error into the store taxonomy.
pub(crate) fn map_redis_error(err: RedisError) -> StoreError {
    if err.kind() == ErrorKind::NoScriptError || err.code() == Some("NOSCRIPT") {
        StoreError::ScriptNotFound(err.to_string())
    } else if err.is_connection_refusal() {
        StoreError::Unavailable(err.to_string())
    } else if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
        StoreError::Interrupted(err.to_string())
    } else {
        StoreError::Rejected(err.to_string())
    }
}

/// Whether a failed command may be sent again.
///
/// Commands that change state are only retried when they cannot have
/// reached the server.
pub(crate) fn is_retryable(err: &StoreError, idempotent: bool) -> bool {
    match err {
        StoreError::Unavailable(_) => true,
        StoreError::Interrupted(_) => idempotent,
        _ => false,
    }
}

/// A [`SharedStore`] backed by a Redis (or protocol compatible) server.
pub struct RedisStore {
    connection_manager: ConnectionManager,
    retry: RetryPolicy,
}

impl RedisStore {
    /// Connect to `url` and verify the connection with a `PING`.
    pub async fn connect(url: &str, retry: RetryPolicy) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| {
            warn!(error = %e, "Invalid Redis URL for rate limiting");
            StoreError::Rejected(format!("invalid store url: {}", e))
        })?;

        let connection_manager =
            tokio::time::timeout(retry.command_timeout, ConnectionManager::new(client))
                .await
                .map_err(|_| StoreError::Timeout(retry.command_timeout.as_millis() as u64))?
                .map_err(|e| {
                    warn!(error = %e, "Failed to create Redis connection manager");
                    map_redis_error(e)
                })?;

        let store = Self {
            connection_manager,
            retry,
        };
        store.ping().await?;

        debug!("Connected to Redis for rate limiting");
        Ok(store)
    }

    /// Run `cmd`, retrying connection failures per the retry policy.
    ///
    /// Timeouts are never retried. A lost connection is retried only for
    /// `idempotent` commands.
    async fn query<T: FromRedisValue + Send>(
        &self,
        cmd: &redis::Cmd,
        idempotent: bool,
    ) -> Result<T, StoreError> {
        let timeout_ms = self.retry.command_timeout.as_millis() as u64;
        let mut attempt = 0;

        loop {
            let mut conn = self.connection_manager.clone();
            let err = match tokio::time::timeout(
                self.retry.command_timeout,
                cmd.query_async::<T>(&mut conn),
            )
            .await
            {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => map_redis_error(e),
                Err(_) => StoreError::Timeout(timeout_ms),
            };

            if !is_retryable(&err, idempotent) || attempt >= self.retry.max_retries {
                return Err(err);
            }

            attempt += 1;
            let delay = self.retry.backoff(attempt);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Redis command failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn load_script(&self, body: &str) -> Result<ScriptHandle, StoreError> {
        let mut cmd = redis::cmd("SCRIPT");
        cmd.arg("LOAD").arg(body);

        let sha: String = self.query(&cmd, true).await?;
        Ok(ScriptHandle::new(sha))
    }

    async fn eval_script(
        &self,
        handle: &ScriptHandle,
        keys: &[&str],
        args: &[String],
    ) -> Result<i64, StoreError> {
        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(handle.as_str()).arg(keys.len());
        for key in keys {
            cmd.arg(*key);
        }
        for arg in args {
            cmd.arg(arg.as_str());
        }

        self.query(&cmd, false).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let _: String = self.query(&redis::cmd("PING"), true).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_delay: Duration::from_millis(120),
            ..RetryPolicy::default()
        };

        assert_eq!(policy.backoff(1), Duration::from_millis(50));
        assert_eq!(policy.backoff(2), Duration::from_millis(100));
        assert_eq!(policy.backoff(3), Duration::from_millis(120));
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.max_delay, Duration::from_secs(2));
    }

    #[test]
    fn test_noscript_maps_to_script_not_found() {
        let err = RedisError::from((ErrorKind::NoScriptError, "No matching script"));
        assert!(map_redis_error(err).is_script_not_found());
    }

    #[test]
    fn test_connection_refused_maps_to_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = RedisError::from(io);
        assert!(matches!(map_redis_error(err), StoreError::Unavailable(_)));
    }

    #[test]
    fn test_dropped_connection_maps_to_interrupted() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken pipe");
        let err = map_redis_error(RedisError::from(io));
        assert!(matches!(err, StoreError::Interrupted(_)));
    }

    #[test]
    fn test_only_unsent_commands_are_retried_when_not_idempotent() {
        let refused = StoreError::Unavailable("refused".into());
        let lost = StoreError::Interrupted("reset".into());
        let timeout = StoreError::Timeout(1000);

        assert!(is_retryable(&refused, false));
        assert!(is_retryable(&refused, true));
        assert!(!is_retryable(&lost, false));
        assert!(is_retryable(&lost, true));
        assert!(!is_retryable(&timeout, false));
        assert!(!is_retryable(&timeout, true));
        assert!(!is_retryable(&StoreError::Rejected("WRONGTYPE".into()), true));
    }

    #[test]
    fn test_response_error_maps_to_rejected() {
        let err = RedisError::from((ErrorKind::ResponseError, "WRONGTYPE"));
        assert!(matches!(map_redis_error(err), StoreError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let result = RedisStore::connect("not a url", RetryPolicy::default()).await;
        assert!(matches!(result, Err(StoreError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let policy = RetryPolicy {
            command_timeout: Duration::from_millis(500),
            ..RetryPolicy::default()
        };
        let result = RedisStore::connect("redis://127.0.0.1:1", policy).await;
        assert!(result.is_err());
    }
}
