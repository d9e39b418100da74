//! Local Service boundary.
//!
//! Relayed requests end up here. The tunnel treats the service as opaque: it
//! hands over `(method, path, headers, body)` and gets back
//! `(status, headers, text body)`. Two adapters are provided: one forwarding
//! to a local HTTP server, one dispatching in-process into an axum router.

mod http;
mod router;

use async_trait::async_trait;
use axum::http::HeaderMap;

use crate::tunnel::protocol::{BODY_ENCODING_HEADER, Headers};

pub use http::HttpForwarder;
pub use router::RouterService;

/// Request headers that describe the tunnel hop rather than the request.
const HOP_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "transfer-encoding",
    BODY_ENCODING_HEADER,
];

/// A request as handed to the Local Service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRequest {
    pub method: String,
    pub path: String,
    pub headers: Headers,
    /// Raw body bytes, already decoded from any transport encoding.
    pub body: Option<Vec<u8>>,
}

/// The Local Service's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: String,
}

/// Errors raised by a Local Service implementation.
#[derive(Debug, thiserror::Error)]
pub enum LocalServiceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// The HTTP-surface collaborator that answers forwarded requests.
///
/// Implementations must tolerate concurrent calls; the tunnel dispatches up to
/// `max_concurrent_requests` requests at once.
#[async_trait]
pub trait LocalService: Send + Sync {
    async fn call(&self, request: LocalRequest) -> Result<LocalResponse, LocalServiceError>;
}

/// Whether a relayed request header should reach the Local Service.
pub(crate) fn is_forwardable(name: &str) -> bool {
    !HOP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Flatten an HTTP header map, joining repeated values with `", "`.
pub(crate) fn collect_headers(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for name in map.keys() {
        let joined = map
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        headers.append(name.as_str(), joined);
    }
    headers
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn hop_headers_are_not_forwarded() {
        assert!(!is_forwardable("Host"));
        assert!(!is_forwardable("content-length"));
        assert!(!is_forwardable("X-Body-Encoding"));
        assert!(is_forwardable("authorization"));
        assert!(is_forwardable("content-type"));
    }

    #[test]
    fn repeated_header_values_are_joined() {
        let mut map = HeaderMap::new();
        map.append("set-cookie", HeaderValue::from_static("a=1"));
        map.append("set-cookie", HeaderValue::from_static("b=2"));
        map.insert("content-type", HeaderValue::from_static("text/plain"));

        let headers = collect_headers(&map);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("set-cookie"), Some("a=1, b=2"));
        assert_eq!(headers.get("content-type"), Some("text/plain"));
    }
}
