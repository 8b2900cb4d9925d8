//! Abstract HTTP-style transport used by transport sessions.
//!
//! The engine never opens sockets itself. A [`Transport`] performs exactly
//! one request/response exchange; authentication, timeouts and retries on
//! challenge live in [`crate::session`].

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// One outgoing request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Target URL.
    pub url: String,
    /// Header name/value pairs, in send order.
    pub headers: Vec<(String, String)>,
    /// Encoded payload.
    pub body: Bytes,
    /// Overall deadline for the exchange.
    pub timeout: Duration,
    /// Connect timeout hint for implementations that dial per request.
    pub connect_timeout: Duration,
}

impl HttpRequest {
    /// Look up a header value, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// One response as received from the peer.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Raw response body.
    pub body: Bytes,
}

impl HttpResponse {
    /// Build a 200 response with a body.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        HttpResponse {
            status: 200,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Look up a header value, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Performs a single request/response exchange with the server.
///
/// Implementations map connection failures to [`crate::RpcError::Transport`];
/// non-2xx statuses are returned as ordinary responses.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send a request and wait for the full response.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let resp = HttpResponse {
            status: 401,
            headers: vec![("WWW-Authenticate".to_string(), "Bearer".to_string())],
            body: Bytes::new(),
        };
        assert_eq!(resp.header("www-authenticate"), Some("Bearer"));
        assert_eq!(resp.header("content-type"), None);
        assert!(!resp.is_success());
    }

    #[test]
    fn test_ok_response() {
        let resp = HttpResponse::ok("{}");
        assert!(resp.is_success());
        assert_eq!(&resp.body[..], b"{}");
    }
}
