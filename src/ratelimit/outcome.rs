//! Results of rate limit checks.

use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

/// Outcome of a check that ran to completion.
///
/// Denial is an ordinary outcome; only configuration and infrastructure
/// problems are reported as [`RateLimitError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allowed,
    Denied,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Why a check could not produce a decision. Callers must treat every
/// variant as a denial.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RateLimitError {
    /// The limit type name is not in the limit table.
    #[error("Invalid rate limit type: {0}")]
    UnknownLimitType(String),

    /// The request itself is malformed (empty identifier, zero tokens).
    #[error("Invalid rate limit request: {0}")]
    InvalidRequest(String),

    /// The caller's address could not be determined.
    #[error("Could not determine IP address.")]
    MissingClientIp,

    /// The shared store failed or the routine could not be run.
    #[error("Rate limiter failed: {0}")]
    Infra(#[from] StoreError),

    /// A remote rate limit service refused or failed the check.
    #[error("{0}")]
    Remote(String),
}

impl RateLimitError {
    /// Configuration errors: unknown limit type names.
    pub fn is_config(&self) -> bool {
        matches!(self, RateLimitError::UnknownLimitType(_))
    }

    /// Infrastructure errors: the store could not decide.
    pub fn is_infra(&self) -> bool {
        matches!(self, RateLimitError::Infra(_))
    }
}

/// What request-handling code branches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitStatus {
    /// Whether the request must be rejected
    pub limited: bool,
    /// Why no decision could be made, if applicable
    pub error: Option<RateLimitError>,
}

impl LimitStatus {
    pub fn allowed() -> Self {
        Self {
            limited: false,
            error: None,
        }
    }

    pub fn denied() -> Self {
        Self {
            limited: true,
            error: None,
        }
    }

    /// A failed check, limited because the limiter fails closed.
    pub fn failed(error: RateLimitError) -> Self {
        Self {
            limited: true,
            error: Some(error),
        }
    }
}

impl From<Result<Decision, RateLimitError>> for LimitStatus {
    fn from(result: Result<Decision, RateLimitError>) -> Self {
        match result {
            Ok(Decision::Allowed) => LimitStatus::allowed(),
            Ok(Decision::Denied) => LimitStatus::denied(),
            Err(e) => LimitStatus::failed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_result_fails_closed() {
        assert!(!LimitStatus::from(Ok(Decision::Allowed)).limited);
        assert!(LimitStatus::from(Ok(Decision::Denied)).limited);

        let status = LimitStatus::from(Err(RateLimitError::Infra(StoreError::Timeout(5))));
        assert!(status.limited);
        assert!(status.error.unwrap().is_infra());
    }

    #[test]
    fn test_error_classification() {
        assert!(RateLimitError::UnknownLimitType("X".into()).is_config());
        assert!(!RateLimitError::MissingClientIp.is_config());
        assert!(RateLimitError::from(StoreError::Unavailable("down".into())).is_infra());
    }

    #[test]
    fn test_decision_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Decision::Denied).unwrap(), "\"denied\"");
    }
}
