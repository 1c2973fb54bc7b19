//! Pure helper functions for the CAS filter
//!
//! Cookie extraction, HTTP client construction and log-safe digests.

use axum::http::HeaderMap;
use std::time::Duration;

/// Create a reqwest client for `serviceValidate` calls using config timeouts
pub fn create_http_client(
    connect_timeout_secs: u64,
    request_timeout_secs: u64,
) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::ClientBuilder::new()
        .redirect(reqwest::redirect::Policy::none()) // Security: prevent SSRF
        .connect_timeout(Duration::from_secs(connect_timeout_secs))
        .timeout(Duration::from_secs(request_timeout_secs))
        .build()
}

/// Extract a cookie value from headers
///
/// Handles multiple Cookie headers (some proxies fold/duplicate headers).
/// Uses `get_all` to collect all Cookie header values.
pub fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let prefix = format!("{}=", name);

    for header_value in headers.get_all("cookie") {
        if let Ok(cookie_str) = header_value.to_str() {
            if let Some(value) = cookie_str
                .split(';')
                .map(|c| c.trim())
                .find(|c| c.starts_with(&prefix))
                .and_then(|c| c.strip_prefix(&prefix))
            {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Digest of a session id, for logs
pub fn session_hash(id: &str) -> String {
    format!("{:x}", md5::compute(id))
}
