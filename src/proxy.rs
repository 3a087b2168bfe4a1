//! Upstream forwarding — builds and sends requests to the orchestrator-facing
//! endpoint
//!
//! Every outbound request carries a cancellable deadline, drops RFC-7230
//! hop-by-hop headers, and stamps `X-Forwarded-For` / `X-Forwarded-Host`
//! when the client did not already provide them.

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use std::time::Duration;

use crate::error::{GatewayError, Result};

/// HTTP client for forwarding requests upstream
pub struct ProxyClient {
    client: reqwest::Client,
    timeout: Duration,
    write_request_uri: bool,
}

/// Response from the upstream endpoint
#[derive(Debug)]
pub struct UpstreamResponse {
    /// HTTP status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

impl ProxyClient {
    /// Create a proxy client with the given per-request deadline
    pub fn new(timeout: Duration, write_request_uri: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(100)
            .build()
            .unwrap_or_default();

        Self {
            client,
            timeout,
            write_request_uri,
        }
    }

    /// Forward a request to `base_url + path_and_query`
    pub async fn forward(
        &self,
        method: &Method,
        base_url: &str,
        path_and_query: &str,
        headers: &HeaderMap,
        client_addr: Option<&str>,
        host: Option<&str>,
        body: Bytes,
    ) -> Result<UpstreamResponse> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), path_and_query);

        if self.write_request_uri {
            tracing::info!(method = %method, url = %url, "forwarding upstream request");
        }

        let mut req_builder = self.client.request(method.clone(), &url);

        for (key, value) in headers.iter() {
            if !is_hop_by_hop(key.as_str()) {
                req_builder = req_builder.header(key.clone(), value.clone());
            }
        }

        if !headers.contains_key("x-forwarded-host") {
            if let Some(host) = host {
                if let Ok(value) = HeaderValue::from_str(host) {
                    req_builder = req_builder.header("X-Forwarded-Host", value);
                }
            }
        }
        if !headers.contains_key("x-forwarded-for") {
            if let Some(addr) = client_addr {
                if let Ok(value) = HeaderValue::from_str(addr) {
                    req_builder = req_builder.header("X-Forwarded-For", value);
                }
            }
        }

        let response = req_builder.body(body).send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Upstream(format!(
                    "request to {} timed out after {}ms",
                    url,
                    self.timeout.as_millis()
                ))
            } else if e.is_connect() {
                GatewayError::Upstream(format!("cannot connect to {}: {}", url, e))
            } else {
                GatewayError::Http(e)
            }
        })?;

        let status = response.status();
        let resp_headers = response.headers().clone();
        let body = response.bytes().await.map_err(GatewayError::Http)?;

        if !status.is_success() {
            tracing::warn!(url = %url, status = %status, "upstream returned non-2xx");
        }

        Ok(UpstreamResponse {
            status,
            headers: resp_headers,
            body,
        })
    }
}

/// Hop-by-hop headers are stripped before a request goes upstream.
///
/// The set follows RFC 7230 plus the non-standard `Proxy-Connection`
/// still sent by some clients.
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "proxy-connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("connection"));
        assert!(is_hop_by_hop("Proxy-Connection"));
        assert!(is_hop_by_hop("Keep-Alive"));
        assert!(is_hop_by_hop("Proxy-Authenticate"));
        assert!(is_hop_by_hop("Proxy-Authorization"));
        assert!(is_hop_by_hop("TE"));
        assert!(is_hop_by_hop("Trailer"));
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(is_hop_by_hop("Upgrade"));

        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("Authorization"));
        assert!(!is_hop_by_hop("X-Call-Id"));
        assert!(!is_hop_by_hop("Host"));
    }

    #[tokio::test]
    async fn test_forward_unreachable_is_upstream_error() {
        let proxy = ProxyClient::new(Duration::from_millis(200), false);
        let result = proxy
            .forward(
                &Method::GET,
                "http://127.0.0.1:1",
                "/function/echo",
                &HeaderMap::new(),
                None,
                None,
                Bytes::new(),
            )
            .await;
        assert!(matches!(result, Err(GatewayError::Upstream(_))));
    }

    #[tokio::test]
    async fn test_forward_round_trip_and_forwarded_headers() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Minimal upstream that echoes the request head back in the body
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let n = stream.read(&mut buf).await.unwrap();
            let head = String::from_utf8_lossy(&buf[..n]).to_string();
            let resp = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                head.len(),
                head
            );
            stream.write_all(resp.as_bytes()).await.unwrap();
        });

        let proxy = ProxyClient::new(Duration::from_secs(2), false);
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("x-custom", HeaderValue::from_static("yes"));

        let resp = proxy
            .forward(
                &Method::POST,
                &format!("http://{}", addr),
                "/function/echo?x=1",
                &headers,
                Some("10.0.0.9"),
                Some("gateway.local"),
                Bytes::from("payload"),
            )
            .await
            .unwrap();

        assert_eq!(resp.status, StatusCode::OK);
        let echoed = String::from_utf8_lossy(&resp.body).to_string();
        assert!(echoed.starts_with("POST /function/echo?x=1"));
        assert!(echoed.to_lowercase().contains("x-custom: yes"));
        assert!(echoed.to_lowercase().contains("x-forwarded-for: 10.0.0.9"));
        assert!(echoed
            .to_lowercase()
            .contains("x-forwarded-host: gateway.local"));
        // Hop-by-hop headers never travel upstream
        assert!(!echoed.to_lowercase().contains("keep-alive"));
    }

    #[tokio::test]
    async fn test_forward_preserves_existing_forwarded_for() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let n = stream.read(&mut buf).await.unwrap();
            let head = String::from_utf8_lossy(&buf[..n]).to_string();
            let resp = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                head.len(),
                head
            );
            stream.write_all(resp.as_bytes()).await.unwrap();
        });

        let proxy = ProxyClient::new(Duration::from_secs(2), false);
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));

        let resp = proxy
            .forward(
                &Method::GET,
                &format!("http://{}", addr),
                "/",
                &headers,
                Some("10.0.0.9"),
                None,
                Bytes::new(),
            )
            .await
            .unwrap();

        let echoed = String::from_utf8_lossy(&resp.body).to_lowercase();
        assert!(echoed.contains("x-forwarded-for: 1.2.3.4"));
        assert!(!echoed.contains("10.0.0.9"));
    }
}
