//! Gateway entrypoint — network listener and request dispatch
//!
//! One accept loop, one task per connection, `service_fn` per request.
//! Lifecycle requests (`/system/functions`) go through admission control;
//! invocation requests (`/function/{name}`) pass the rate gate and the
//! per-function scheduler; async invocations (`/async-function/{name}`)
//! reserve a queue slot and are re-delivered by the work-queue dispatch.

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::admission::{AdmissionControl, AdmissionRequest, ReserveAdmission};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::invoke::{check_admission, GateDecision};
use crate::manager::ResourceManager;
use crate::proxy::ProxyClient;
use crate::queue::{HandlerRegistry, InvocationRequest, InvokeOutcome};
use crate::scaling::{Scaler, ScalerSettings, ServiceQuery};

/// Shared state for request handling
pub struct AppState {
    /// Gateway configuration
    pub config: GatewayConfig,
    /// Process-wide scaling state
    pub scaler: Arc<Scaler>,
    /// Orchestrator-facing operations
    pub manager: Arc<ResourceManager>,
    /// Per-function invocation schedulers
    pub handlers: Arc<HandlerRegistry>,
    /// Admission policy
    pub admission: Arc<dyn AdmissionControl>,
    /// Upstream forwarding client
    pub proxy: Arc<ProxyClient>,
}

impl AppState {
    /// Wire all components over an injected orchestrator backend
    pub fn new(config: GatewayConfig, query: Arc<dyn ServiceQuery>) -> Self {
        let scaler = Arc::new(Scaler::new(
            query,
            config.cache_expiry(),
            ScalerSettings::from_config(&config),
        ));
        let proxy = Arc::new(ProxyClient::new(
            config.upstream_timeout(),
            config.write_request_uri,
        ));
        let manager = Arc::new(ResourceManager::new(
            scaler.clone(),
            proxy.clone(),
            config.upstream_url.clone(),
        ));
        let handlers = Arc::new(HandlerRegistry::new(
            proxy.clone(),
            config.upstream_url.clone(),
            config.queue_capacity,
        ));
        let admission = Arc::new(ReserveAdmission::new(manager.clone(), handlers.clone()));

        Self {
            config,
            scaler,
            manager,
            handlers,
            admission,
            proxy,
        }
    }
}

/// Bind the configured listener and start serving.
///
/// Returns the bound address (useful when the config asked for port 0)
/// and the accept-loop task handle.
pub async fn serve(state: Arc<AppState>) -> Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = TcpListener::bind(&state.config.listen)
        .await
        .map_err(|e| GatewayError::Config(format!("failed to bind {}: {}", state.config.listen, e)))?;
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "gateway listening");

    let handle = tokio::spawn(async move {
        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            let state = state.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let _ = http1::Builder::new()
                    .serve_connection(
                        io,
                        service_fn(move |req| handle_request(req, remote_addr, state.clone())),
                    )
                    .await;
            });
        }
    });

    Ok((addr, handle))
}

/// Dispatch one HTTP request
async fn handle_request(
    req: hyper::Request<Incoming>,
    remote_addr: SocketAddr,
    state: Arc<AppState>,
) -> std::result::Result<hyper::Response<Full<Bytes>>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let body_bytes = match http_body_util::BodyExt::collect(body).await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Bytes::new(),
    };

    let path = parts.uri.path().to_string();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let host = parts
        .headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let client_addr = remote_addr.ip().to_string();

    let response = if path == "/system/functions" || path.starts_with("/system/functions/") {
        let admission_req = AdmissionRequest {
            path: path_and_query.clone(),
            name: unregister_name(&path, &body_bytes),
            headers: parts.headers.clone(),
            client_addr: Some(client_addr.clone()),
            host: host.clone(),
            body: body_bytes,
        };
        let result = match parts.method {
            Method::POST => state.admission.register(admission_req).await,
            Method::PUT => state.admission.update(admission_req).await,
            Method::DELETE => state.admission.unregister(admission_req).await,
            _ => crate::admission::AdmissionResponse::error(
                StatusCode::METHOD_NOT_ALLOWED,
                "method not allowed",
            ),
        };
        build_response(result.status, &result.headers, result.body)
    } else if let Some(name) = path.strip_prefix("/function/") {
        let name = function_name(name);
        let call_id = header_value(&parts.headers, "x-call-id");
        let request = InvocationRequest {
            method: parts.method.clone(),
            path_and_query,
            headers: parts.headers.clone(),
            client_addr: Some(client_addr),
            host,
            body: body_bytes,
        };
        let (status, headers, body) =
            run_invocation(&state, &name, call_id.as_deref(), request).await;
        build_response(status, &headers, body)
    } else if let Some(name) = path.strip_prefix("/async-function/") {
        let name = function_name(name);
        handle_async_enqueue(&state, &name, &parts, client_addr, host, body_bytes).await
    } else {
        build_response(
            StatusCode::NOT_FOUND,
            &HeaderMap::new(),
            Bytes::from(r#"{"error":"no route matched"}"#),
        )
    };

    Ok(response)
}

/// Gate and execute one invocation, returning the response surface
async fn run_invocation(
    state: &AppState,
    name: &str,
    call_id: Option<&str>,
    request: InvocationRequest,
) -> (StatusCode, HeaderMap, Bytes) {
    match check_admission(&state.scaler, name, call_id).await {
        GateDecision::RateLimited => {
            tracing::info!(function = name, "invocation rate limit exhausted");
            (StatusCode::REQUEST_TIMEOUT, HeaderMap::new(), Bytes::new())
        }
        GateDecision::Admit => {
            match state.handlers.invoke(name, call_id, request.clone()).await {
                InvokeOutcome::Completed(Ok(res)) => (res.status, res.headers, res.body),
                InvokeOutcome::Completed(Err(e)) => (
                    e.status_code(),
                    HeaderMap::new(),
                    Bytes::from(e.to_string()),
                ),
                InvokeOutcome::Rejected => {
                    tracing::warn!(function = name, "too many requests");
                    (
                        StatusCode::FORBIDDEN,
                        HeaderMap::new(),
                        Bytes::from("Too many requests"),
                    )
                }
                InvokeOutcome::Unmanaged => {
                    // No scheduler owns this function: forward directly.
                    let result = state
                        .proxy
                        .forward(
                            &request.method,
                            &state.config.upstream_url,
                            &request.path_and_query,
                            &request.headers,
                            request.client_addr.as_deref(),
                            request.host.as_deref(),
                            request.body,
                        )
                        .await;
                    match result {
                        Ok(res) => (res.status, res.headers, res.body),
                        Err(e) => (
                            e.status_code(),
                            HeaderMap::new(),
                            Bytes::from(e.to_string()),
                        ),
                    }
                }
            }
        }
    }
}

/// Reserve an async slot and schedule the deferred delivery
async fn handle_async_enqueue(
    state: &Arc<AppState>,
    name: &str,
    parts: &http::request::Parts,
    client_addr: String,
    host: Option<String>,
    body: Bytes,
) -> hyper::Response<Full<Bytes>> {
    if parts.method != Method::POST {
        return build_response(
            StatusCode::METHOD_NOT_ALLOWED,
            &HeaderMap::new(),
            Bytes::from("method not allowed"),
        );
    }

    let call_id = match header_value(&parts.headers, "x-call-id") {
        Some(id) if !id.is_empty() => id,
        _ => {
            // The id is minted by an upstream layer; its absence is an
            // internal error, not a client one.
            return build_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &HeaderMap::new(),
                Bytes::from("Unable to create X-Call-Id"),
            );
        }
    };

    let callback_url = match header_value(&parts.headers, "x-callback-url") {
        Some(raw) => match raw.parse::<http::Uri>() {
            Ok(_) => Some(raw),
            Err(e) => {
                return build_response(
                    StatusCode::BAD_REQUEST,
                    &HeaderMap::new(),
                    Bytes::from(e.to_string()),
                );
            }
        },
        None => None,
    };

    if let Err(e) = state.handlers.async_invoke(name, &call_id) {
        tracing::warn!(function = name, error = %e, "cannot invoke function asynchronously");
        return build_response(e.status_code(), &HeaderMap::new(), Bytes::from(e.to_string()));
    }

    // Pre-admitted: the deferred delivery must not be double-accounted.
    state.scaler.bypass.insert(&call_id);

    let request = InvocationRequest {
        method: parts.method.clone(),
        path_and_query: format!("/function/{}", name),
        headers: parts.headers.clone(),
        client_addr: Some(client_addr),
        host,
        body,
    };

    // Work-queue dispatch: deliver the invocation out of band and post the
    // outcome to the callback URL when one was supplied.
    let state = state.clone();
    let name = name.to_string();
    tokio::spawn(async move {
        let (status, _headers, body) =
            run_invocation(&state, &name, Some(&call_id), request).await;
        tracing::info!(function = %name, status = %status, "async invocation finished");

        if let Some(url) = callback_url {
            let client = reqwest::Client::new();
            let result = client
                .post(&url)
                .header("X-Call-Id", call_id.clone())
                .header("X-Function-Status", status.as_str())
                .body(body)
                .send()
                .await;
            if let Err(e) = result {
                tracing::error!(function = %name, callback = %url, error = %e, "callback failed");
            }
        }
    });

    build_response(StatusCode::ACCEPTED, &HeaderMap::new(), Bytes::new())
}

/// Last path segment with any trailing slash trimmed
fn function_name(raw: &str) -> String {
    let trimmed = raw.trim_end_matches('/');
    trimmed
        .rsplit('/')
        .next()
        .unwrap_or(trimmed)
        .to_string()
}

/// Function name for an unregister request: path suffix first, body fallback
fn unregister_name(path: &str, body: &Bytes) -> Option<String> {
    if let Some(suffix) = path.strip_prefix("/system/functions/") {
        let name = function_name(suffix);
        if !name.is_empty() {
            return Some(name);
        }
    }
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value
        .get("functionName")
        .or_else(|| value.get("service"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn build_response(
    status: StatusCode,
    headers: &HeaderMap,
    body: Bytes,
) -> hyper::Response<Full<Bytes>> {
    let mut builder = hyper::Response::builder().status(status);
    for (key, value) in headers.iter() {
        // The body is re-framed by this server
        if *key == http::header::CONTENT_LENGTH || *key == http::header::TRANSFER_ENCODING {
            continue;
        }
        builder = builder.header(key, value);
    }
    builder
        .body(Full::new(body))
        .unwrap_or_else(|_| hyper::Response::new(Full::new(Bytes::new())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_name_extraction() {
        assert_eq!(function_name("echo"), "echo");
        assert_eq!(function_name("echo/"), "echo");
        assert_eq!(function_name("nested/echo"), "echo");
    }

    #[test]
    fn test_unregister_name_from_path() {
        let name = unregister_name("/system/functions/resize", &Bytes::new());
        assert_eq!(name.as_deref(), Some("resize"));
    }

    #[test]
    fn test_unregister_name_from_body() {
        let body = Bytes::from(r#"{"functionName": "resize"}"#);
        assert_eq!(
            unregister_name("/system/functions", &body).as_deref(),
            Some("resize")
        );

        let body = Bytes::from(r#"{"service": "blur"}"#);
        assert_eq!(
            unregister_name("/system/functions", &body).as_deref(),
            Some("blur")
        );
    }

    #[test]
    fn test_unregister_name_missing() {
        assert_eq!(unregister_name("/system/functions", &Bytes::new()), None);
    }

    #[test]
    fn test_build_response_drops_framing_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("content-length", "999".parse().unwrap());
        headers.insert("x-kept", "yes".parse().unwrap());
        let response = build_response(StatusCode::OK, &headers, Bytes::from("ok"));
        assert!(response.headers().get("content-length").is_none());
        assert_eq!(response.headers().get("x-kept").unwrap(), "yes");
    }
}
