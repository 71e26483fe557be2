//! Entry points used by request-handling code.
//!
//! The gateway turns engine results into the `{limited, error}` shape that
//! route handlers and middleware branch on. It keeps no state of its own.

mod client_ip;

pub use client_ip::extract_client_ip;

use std::sync::Arc;
use tracing::warn;

use crate::ratelimit::{LimitStatus, LimitType, RateLimitEngine, RateLimitError};

/// In-process rate limit helpers for IP-based and identifier-based checks.
#[derive(Clone)]
pub struct RateLimitGateway {
    engine: Arc<RateLimitEngine>,
}

impl RateLimitGateway {
    pub fn new(engine: Arc<RateLimitEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<RateLimitEngine> {
        &self.engine
    }

    /// Apply the `GENERAL_IP` limit to a client address.
    pub async fn apply_ip_rate_limit(&self, client_ip: Option<&str>) -> LimitStatus {
        self.apply_ip_rate_limit_for(client_ip, LimitType::GeneralIp.as_str())
            .await
    }

    /// Apply `limit_type` to a client address.
    ///
    /// An unknown address is always limited: callers without an identity do
    /// not get a free pass.
    pub async fn apply_ip_rate_limit_for(
        &self,
        client_ip: Option<&str>,
        limit_type: &str,
    ) -> LimitStatus {
        let ip = match client_ip.map(str::trim) {
            Some(ip) if !ip.is_empty() => ip,
            _ => {
                warn!(limit_type = %limit_type, "Could not determine IP address");
                return LimitStatus::failed(RateLimitError::MissingClientIp);
            }
        };

        self.engine.check(ip, limit_type).await.into()
    }

    /// Apply the `SENSITIVE_IDENTIFIER` limit to an identifier.
    pub async fn apply_identifier_rate_limit(&self, identifier: &str) -> LimitStatus {
        self.apply_identifier_rate_limit_for(identifier, LimitType::SensitiveIdentifier.as_str())
            .await
    }

    /// Apply `limit_type` to an identifier such as an email or username.
    pub async fn apply_identifier_rate_limit_for(
        &self,
        identifier: &str,
        limit_type: &str,
    ) -> LimitStatus {
        if identifier.is_empty() {
            return LimitStatus::failed(RateLimitError::InvalidRequest(
                "Identifier required for this rate limit.".to_string(),
            ));
        }

        self.engine.check(identifier, limit_type).await.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::LimitTable;
    use crate::store::MemoryStore;

    fn gateway() -> (RateLimitGateway, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let engine = RateLimitEngine::new(store.clone(), LimitTable::builtin()).with_clock(clock);
        (RateLimitGateway::new(Arc::new(engine)), store)
    }

    #[tokio::test]
    async fn test_unknown_ip_is_limited_without_store_call() {
        let (gateway, store) = gateway();

        let status = gateway.apply_ip_rate_limit(None).await;
        assert!(status.limited);
        assert_eq!(status.error, Some(RateLimitError::MissingClientIp));

        let status = gateway.apply_ip_rate_limit(Some("  ")).await;
        assert!(status.limited);

        assert_eq!(store.eval_count(), 0);
        assert_eq!(store.script_load_count(), 0);
    }

    #[tokio::test]
    async fn test_ip_limit_uses_general_ip_bucket() {
        let (gateway, store) = gateway();

        let status = gateway.apply_ip_rate_limit(Some("203.0.113.7")).await;
        assert_eq!(status, LimitStatus::allowed());
        assert_eq!(store.bucket("rl:ip:203.0.113.7").unwrap().tokens, 99.0);
    }

    #[tokio::test]
    async fn test_ip_limit_with_explicit_type() {
        let (gateway, store) = gateway();

        let status = gateway
            .apply_ip_rate_limit_for(Some("203.0.113.7"), "API_HEAVY_ENDPOINT")
            .await;
        assert!(!status.limited);
        assert!(store.bucket("rl:api_heavy:203.0.113.7").is_some());
    }

    #[tokio::test]
    async fn test_identifier_limit_exhausts_after_five() {
        let (gateway, _) = gateway();

        for _ in 0..5 {
            let status = gateway.apply_identifier_rate_limit("user@example.com").await;
            assert!(!status.limited);
        }

        let status = gateway.apply_identifier_rate_limit("user@example.com").await;
        assert_eq!(status, LimitStatus::denied());
    }

    #[tokio::test]
    async fn test_empty_identifier_is_limited() {
        let (gateway, store) = gateway();

        let status = gateway.apply_identifier_rate_limit("").await;
        assert!(status.limited);
        assert!(matches!(status.error, Some(RateLimitError::InvalidRequest(_))));
        assert_eq!(store.eval_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_limit_type_is_limited() {
        let (gateway, _) = gateway();

        let status = gateway
            .apply_identifier_rate_limit_for("user@example.com", "NOT_A_TYPE")
            .await;
        assert!(status.limited);
        assert!(status.error.unwrap().is_config());
    }
}
