//! Client address extraction from proxy headers.

use axum::http::HeaderMap;

/// The caller's address as reported by the fronting proxy.
///
/// `X-Real-IP` wins; otherwise the leftmost `X-Forwarded-For` entry is used.
/// Returns `None` when neither header carries a usable value.
pub fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    from_x_real_ip(headers).or_else(|| from_xff(headers))
}

fn from_x_real_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}

fn from_xff(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}
