//! JSON bodies exchanged over `POST /rate-limit`.

use serde::{Deserialize, Serialize};

/// Request body. Field names follow the public API (`limitType`).
///
/// Fields are optional so that a missing field and a field of the wrong
/// type can be told apart from a body that is not JSON at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct CheckRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(
        rename = "limitType",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub limit_type: Option<String>,
}

impl CheckRequest {
    pub fn new(identifier: &str, limit_type: &str) -> Self {
        Self {
            identifier: Some(identifier.to_string()),
            limit_type: Some(limit_type.to_string()),
        }
    }
}

/// Response body for every status code the endpoint produces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct CheckReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckReply {
    pub fn allowed() -> Self {
        Self {
            allowed: Some(true),
            ..Default::default()
        }
    }

    pub fn refused(message: &str) -> Self {
        Self {
            allowed: Some(false),
            message: Some(message.to_string()),
            error: None,
        }
    }

    pub fn bad_request(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

pub(crate) const RATE_LIMIT_EXCEEDED: &str = "Rate limit exceeded.";
pub(crate) const RATE_LIMIT_FAILED: &str = "Rate limit check failed.";
