//! Resource manager — low-level communication with the container
//! orchestrator on behalf of admission policies
//!
//! Owns the image lifecycle requests (create/update/remove forwarded
//! through the proxy client with the method rewritten), the scale-and-wait
//! replica protocol, and the read-through of real-time parameters into the
//! function cache.

use bytes::Bytes;
use http::{HeaderMap, Method};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{GatewayError, Result};
use crate::proxy::{ProxyClient, UpstreamResponse};
use crate::scaling::{Scaler, ServiceState};

/// Orchestrator-facing operations used by admission control
pub struct ResourceManager {
    scaler: Arc<Scaler>,
    proxy: Arc<ProxyClient>,
    base_url: String,
}

impl ResourceManager {
    /// Create a resource manager forwarding to `base_url`
    pub fn new(scaler: Arc<Scaler>, proxy: Arc<ProxyClient>, base_url: impl Into<String>) -> Self {
        Self {
            scaler,
            proxy,
            base_url: base_url.into(),
        }
    }

    /// The process-wide scaler
    pub fn scaler(&self) -> &Arc<Scaler> {
        &self.scaler
    }

    /// Create a container image for a function deployment (POST upstream)
    pub async fn create_image(
        &self,
        path: &str,
        headers: &HeaderMap,
        client_addr: Option<&str>,
        host: Option<&str>,
        body: Bytes,
    ) -> Result<UpstreamResponse> {
        self.process_request(Method::POST, path, headers, client_addr, host, body)
            .await
    }

    /// Modify an existing image in the orchestrator (PUT upstream)
    pub async fn update_image(
        &self,
        path: &str,
        headers: &HeaderMap,
        client_addr: Option<&str>,
        host: Option<&str>,
        body: Bytes,
    ) -> Result<UpstreamResponse> {
        self.process_request(Method::PUT, path, headers, client_addr, host, body)
            .await
    }

    /// Remove a function description and image (DELETE upstream)
    pub async fn remove_image(
        &self,
        path: &str,
        headers: &HeaderMap,
        client_addr: Option<&str>,
        host: Option<&str>,
        body: Bytes,
    ) -> Result<UpstreamResponse> {
        self.process_request(Method::DELETE, path, headers, client_addr, host, body)
            .await
    }

    async fn process_request(
        &self,
        method: Method,
        path: &str,
        headers: &HeaderMap,
        client_addr: Option<&str>,
        host: Option<&str>,
        body: Bytes,
    ) -> Result<UpstreamResponse> {
        let result = self
            .proxy
            .forward(&method, &self.base_url, path, headers, client_addr, host, body)
            .await;

        match &result {
            Err(e) => {
                tracing::error!(path, error = %e, "error with upstream request");
            }
            Ok(res) if !res.status.is_success() => {
                tracing::error!(path, status = %res.status, "error with upstream request");
            }
            Ok(_) => {}
        }
        result
    }

    /// Drive the orchestrator to `target` replicas.
    ///
    /// `SetReplicas` is wrapped in a bounded linear backoff; each attempt
    /// refreshes the cache first. After a successful set, the desired
    /// replica count is polled up to `max_poll_count` times and the call
    /// succeeds as soon as `replicas >= target`. Exhausting the poll budget
    /// is not a failure — convergence of ready replicas is verified
    /// separately by [`wait_for_available`](Self::wait_for_available).
    pub async fn scale(&self, name: &str, target: u64) -> Result<()> {
        let settings = &self.scaler.settings;
        let mut last_err: Option<GatewayError> = None;
        let mut set_ok = false;

        for attempt in 0..settings.set_scale_retries {
            match self.scaler.query.get_replicas(name).await {
                Ok(state) => {
                    self.scaler.cache.set(name, state);
                    tracing::info!(attempt, function = name, target, "requesting replica count");
                    match self.scaler.query.set_replicas(name, target).await {
                        Ok(()) => {
                            set_ok = true;
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(attempt, function = name, error = %e, "set replicas failed");
                            last_err = Some(e);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(attempt, function = name, error = %e, "replica query failed");
                    last_err = Some(e);
                }
            }
            tokio::time::sleep(settings.poll_interval).await;
        }

        if !set_ok {
            let detail = last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempts made".into());
            return Err(GatewayError::Capacity(format!(
                "unable to scale function {}: {}",
                name, detail
            )));
        }

        for _ in 0..settings.max_poll_count {
            let state = self
                .scaler
                .query
                .get_replicas(name)
                .await
                .map_err(|e| GatewayError::Capacity(format!("replica poll failed: {}", e)))?;
            self.scaler.cache.set(name, state.clone());

            if state.replicas >= target {
                tracing::info!(function = name, replicas = state.replicas, "scale successful");
                return Ok(());
            }
            tokio::time::sleep(settings.poll_interval).await;
        }

        Ok(())
    }

    /// Poll until `target` replicas report ready.
    ///
    /// The deadline is progress-based rather than wall-clock: the attempt
    /// counter resets whenever availability strictly increases, so a slowly
    /// converging deployment is not cut off mid-progress. Returns true only
    /// when a read observed `available == target`.
    pub async fn wait_for_available(
        &self,
        name: &str,
        target: u64,
        max_attempts: u64,
        interval: Duration,
    ) -> bool {
        let mut prev_available = 0u64;
        let mut attempt = 0u64;

        while attempt < max_attempts {
            if let Ok(state) = self.scaler.query.get_replicas(name).await {
                tracing::debug!(
                    attempt,
                    function = name,
                    available = state.available_replicas,
                    need = target,
                    "waiting for replicas"
                );
                if state.available_replicas == target {
                    return true;
                }
                if state.available_replicas > prev_available {
                    attempt = 0;
                }
                prev_available = state.available_replicas;
            }
            attempt += 1;
            tokio::time::sleep(interval).await;
        }
        false
    }

    /// Read the real-time parameters of a function, warming the cache
    pub async fn get_realtime_params(&self, name: &str) -> Result<ServiceState> {
        let state = self.scaler.query.get_replicas(name).await?;
        self.scaler.cache.set(name, state.clone());
        Ok(state)
    }
}
