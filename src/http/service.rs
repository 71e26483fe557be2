//! Rate limit API handlers.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use super::wire::{CheckReply, CheckRequest, RATE_LIMIT_EXCEEDED, RATE_LIMIT_FAILED};
use crate::gateway::RateLimitGateway;
use crate::ratelimit::RateLimitError;

/// Build the service router: `POST /rate-limit` and `GET /healthz`.
pub fn router(gateway: RateLimitGateway) -> Router {
    Router::new()
        .route("/rate-limit", post(check_rate_limit))
        .route("/healthz", get(healthz))
        .with_state(gateway)
}

/// Check and consume one token for `{identifier, limitType}`.
///
/// Every malformed request, including a non-JSON one, gets the same 400
/// shape.
#[instrument(skip_all, fields(request_id = %Uuid::new_v4()))]
async fn check_rate_limit(State(gateway): State<RateLimitGateway>, body: Bytes) -> Response {
    let request = match serde_json::from_slice::<Value>(&body) {
        Ok(payload) if payload.is_object() => {
            serde_json::from_value::<CheckRequest>(payload).ok()
        }
        Ok(_) => None,
        Err(e) => {
            debug!(error = %e, "Rejected non-JSON rate limit request");
            return reply(
                StatusCode::BAD_REQUEST,
                CheckReply::bad_request("Invalid input: request body must be JSON."),
            );
        }
    };

    let (identifier, limit_type) = match request {
        Some(CheckRequest {
            identifier: Some(identifier),
            limit_type: Some(limit_type),
        }) => (identifier, limit_type),
        _ => {
            return reply(
                StatusCode::BAD_REQUEST,
                CheckReply::bad_request(
                    "Invalid input: identifier and limitType are required strings.",
                ),
            )
        }
    };
    let (identifier, limit_type) = (identifier.as_str(), limit_type.as_str());

    if !gateway.engine().limits().contains(limit_type) {
        return reply(
            StatusCode::BAD_REQUEST,
            CheckReply::bad_request(format!("Invalid limitType: {}", limit_type)),
        );
    }

    let status = gateway
        .apply_identifier_rate_limit_for(identifier, limit_type)
        .await;

    match status.error {
        Some(e @ (RateLimitError::UnknownLimitType(_) | RateLimitError::InvalidRequest(_))) => {
            reply(StatusCode::BAD_REQUEST, CheckReply::bad_request(e.to_string()))
        }
        Some(e) => {
            error!(
                identifier = %identifier,
                limit_type = %limit_type,
                error = %e,
                "Internal error checking rate limit"
            );
            reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                CheckReply::refused(RATE_LIMIT_FAILED),
            )
        }
        None if status.limited => {
            warn!(
                identifier = %identifier,
                limit_type = %limit_type,
                "Rate limit exceeded"
            );
            reply(
                StatusCode::TOO_MANY_REQUESTS,
                CheckReply::refused(RATE_LIMIT_EXCEEDED),
            )
        }
        None => reply(StatusCode::OK, CheckReply::allowed()),
    }
}

/// 200 when the store answers a ping, 503 otherwise.
async fn healthz(State(gateway): State<RateLimitGateway>) -> Response {
    match gateway.engine().ping().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response(),
        Err(e) => {
            warn!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable" })),
            )
                .into_response()
        }
    }
}

fn reply(status: StatusCode, body: CheckReply) -> Response {
    (status, Json(body)).into_response()
}
