#![warn(missing_docs)]

//! HTTP transport for the tether client engine, backed by `reqwest`.

/// Command-line client.
pub mod cli;

use std::time::Duration;

use async_trait::async_trait;
use tether_core::{HttpRequest, HttpResponse, RpcError, Transport};
use thiserror::Error;
use tracing::trace;

/// Errors raised while setting up the HTTP transport.
#[derive(Debug, Error)]
pub enum HttpTransportError {
    /// The underlying client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

/// [`Transport`] sending each exchange as an HTTP POST on a shared client.
///
/// The client keeps a connection pool, so concurrent partitions reuse
/// connections to the same endpoint.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a transport with the given connect timeout.
    pub fn new(connect_timeout: Duration) -> Result<Self, HttpTransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("tether/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(ReqwestTransport { client })
    }

    /// Wrap an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        ReqwestTransport { client }
    }
}

fn map_error(err: reqwest::Error, timeout: Duration) -> RpcError {
    if err.is_timeout() {
        RpcError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    } else {
        RpcError::Transport {
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> tether_core::Result<HttpResponse> {
        let timeout = request.timeout;
        let mut builder = self.client.post(&request.url).body(request.body);
        if !timeout.is_zero() {
            builder = builder.timeout(timeout);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|e| map_error(e, timeout))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(|e| map_error(e, timeout))?;
        trace!(status, bytes = body.len(), url = %request.url, "http exchange");
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_transport() {
        assert!(ReqwestTransport::new(Duration::from_secs(1)).is_ok());
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let transport = ReqwestTransport::new(Duration::from_millis(200)).unwrap();
        let request = HttpRequest {
            // port 9 (discard) is closed on test machines
            url: "http://127.0.0.1:9/rpc".to_string(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: bytes::Bytes::from_static(b"{}"),
            timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_millis(200),
        };
        let err = transport.send(request).await.unwrap_err();
        assert!(err.is_transport_level());
    }
}
