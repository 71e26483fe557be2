//! Client for a remote rate limit API.

use reqwest::StatusCode;
use std::time::Duration;
use tracing::{error, warn};

use super::wire::{CheckReply, CheckRequest};
use crate::error::{Result, WardenError};
use crate::ratelimit::{LimitStatus, RateLimitError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const NETWORK_ERROR: &str = "Rate limit check failed due to network error.";
const UNPARSEABLE_ERROR: &str = "Failed to parse error response.";

/// Calls `POST {base_url}/rate-limit` on another instance.
///
/// Every failure is reported as limited.
#[derive(Debug, Clone)]
pub struct RateLimitClient {
    http: reqwest::Client,
    endpoint: String,
}

impl RateLimitClient {
    /// Client with the default request timeout.
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    /// Client whose requests fail (and so limit) after `timeout`.
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WardenError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(http, base_url))
    }

    /// Use a preconfigured `reqwest` client (timeouts, TLS, proxies).
    pub fn with_client(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            endpoint: format!("{}/rate-limit", base_url.trim_end_matches('/')),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Check and consume one token for `identifier` under `limit_type`.
    pub async fn apply_rate_limit_via_api(&self, identifier: &str, limit_type: &str) -> LimitStatus {
        let request = CheckRequest::new(identifier, limit_type);

        let response = match self.http.post(&self.endpoint).json(&request).send().await {
            Ok(response) => response,
            Err(e) => {
                error!(
                    identifier = %identifier,
                    endpoint = %self.endpoint,
                    error = %e,
                    "Network error calling rate limit API"
                );
                return LimitStatus::failed(RateLimitError::Remote(NETWORK_ERROR.to_string()));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<CheckReply>().await {
                Ok(body) => body
                    .message
                    .or(body.error)
                    .unwrap_or_else(|| format!("Rate limit API error: {}", status.as_u16())),
                Err(_) => UNPARSEABLE_ERROR.to_string(),
            };

            if status == StatusCode::TOO_MANY_REQUESTS {
                warn!(identifier = %identifier, message = %message, "Rate limit exceeded via API");
            } else {
                error!(
                    identifier = %identifier,
                    status = status.as_u16(),
                    message = %message,
                    "Error calling rate limit API"
                );
            }
            return LimitStatus::failed(RateLimitError::Remote(message));
        }

        match response.json::<CheckReply>().await {
            Ok(body) => LimitStatus {
                limited: !body.allowed.unwrap_or(false),
                error: None,
            },
            Err(e) => {
                error!(identifier = %identifier, error = %e, "Unreadable rate limit API response");
                LimitStatus::failed(RateLimitError::Remote(NETWORK_ERROR.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_base_url() {
        assert_eq!(
            RateLimitClient::new("http://localhost:3000/").unwrap().endpoint(),
            "http://localhost:3000/rate-limit"
        );
        assert_eq!(
            RateLimitClient::new("http://limits.internal").unwrap().endpoint(),
            "http://limits.internal/rate-limit"
        );
    }

    #[tokio::test]
    async fn test_stalled_api_times_out_limited() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let client =
            RateLimitClient::with_timeout(&format!("http://{}", addr), Duration::from_millis(200))
                .unwrap();
        let status = tokio::time::timeout(
            Duration::from_secs(5),
            client.apply_rate_limit_via_api("user@example.com", "GENERAL_IP"),
        )
        .await
        .expect("client must give up on its own");

        assert!(status.limited);
        assert_eq!(status.error, Some(RateLimitError::Remote(NETWORK_ERROR.to_string())));
    }

    #[tokio::test]
    async fn test_unreachable_api_is_limited() {
        let client = RateLimitClient::new("http://127.0.0.1:1").unwrap();

        let status = client.apply_rate_limit_via_api("user@example.com", "GENERAL_IP").await;
        assert!(status.limited);
        assert_eq!(status.error, Some(RateLimitError::Remote(NETWORK_ERROR.to_string())));
    }
}
