//! Per-IP rate limiting for axum routers.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{error, warn};

use super::wire::{CheckReply, RATE_LIMIT_EXCEEDED, RATE_LIMIT_FAILED};
use crate::gateway::{extract_client_ip, RateLimitGateway};
use crate::ratelimit::{LimitType, RateLimitError};

/// State for [`ip_rate_limit`]: which gateway to ask and which limit to apply.
#[derive(Clone)]
pub struct IpLimitState {
    gateway: RateLimitGateway,
    limit_type: String,
}

impl IpLimitState {
    pub fn new(gateway: RateLimitGateway, limit_type: impl Into<String>) -> Self {
        Self {
            gateway,
            limit_type: limit_type.into(),
        }
    }

    /// Apply `GENERAL_IP`.
    pub fn general(gateway: RateLimitGateway) -> Self {
        Self::new(gateway, LimitType::GeneralIp.as_str())
    }
}

/// Reject requests whose client address is over its limit.
///
/// Install with `axum::middleware::from_fn_with_state(state, ip_rate_limit)`.
/// Requests without a usable `X-Real-IP` or `X-Forwarded-For` header are
/// rejected with 429. Store failures and a misconfigured limit type give 500.
pub async fn ip_rate_limit(
    State(state): State<IpLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let client_ip = extract_client_ip(request.headers());
    let status = state
        .gateway
        .apply_ip_rate_limit_for(client_ip.as_deref(), &state.limit_type)
        .await;

    if !status.limited {
        return next.run(request).await;
    }

    match status.error {
        Some(e) if e.is_infra() || e.is_config() => {
            error!(
                client_ip = ?client_ip,
                limit_type = %state.limit_type,
                error = %e,
                "IP rate limit check failed"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(CheckReply::refused(RATE_LIMIT_FAILED)),
            )
                .into_response()
        }
        Some(e @ RateLimitError::MissingClientIp) => {
            warn!(limit_type = %state.limit_type, "Rejected request without client IP");
            (
                StatusCode::TOO_MANY_REQUESTS,
                Json(CheckReply::refused(&e.to_string())),
            )
                .into_response()
        }
        _ => {
            warn!(
                client_ip = ?client_ip,
                limit_type = %state.limit_type,
                "IP rate limit exceeded"
            );
            (
                StatusCode::TOO_MANY_REQUESTS,
                Json(CheckReply::refused(RATE_LIMIT_EXCEEDED)),
            )
                .into_response()
        }
    }
}
