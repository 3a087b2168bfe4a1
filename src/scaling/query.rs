//! Service query — trait and implementations for replica reads and writes
//!
//! The gateway never depends on orchestrator-specific types; anything that
//! can report and set a replica count (Kubernetes, Docker Swarm, an
//! in-memory mock) satisfies the same two-method contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{GatewayError, Result};

/// Scaling state of a function as reported by the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceState {
    /// Desired replica count
    pub replicas: u64,
    /// Replicas currently ready to serve
    #[serde(rename = "availableReplicas")]
    pub available_replicas: u64,
    /// Orchestrator-owned scaling floor
    #[serde(rename = "minReplicas")]
    pub min_replicas: u64,
    /// Orchestrator-owned scaling ceiling
    #[serde(rename = "maxReplicas")]
    pub max_replicas: u64,
    /// Orchestrator-owned scaling step
    #[serde(rename = "scalingFactor")]
    pub scaling_factor: u64,
    /// Guaranteed invocation rate echoed from the deployment labels
    pub realtime: f64,
    /// Per-container concurrency echoed from the deployment labels
    pub concurrency: u64,
    /// Execution timeout (ms) echoed from the deployment labels
    pub timeout: u64,
}

/// Replica querying/setting contract over the orchestrator
#[async_trait]
pub trait ServiceQuery: Send + Sync {
    /// Read the scaling state of a function
    async fn get_replicas(&self, service: &str) -> Result<ServiceState>;

    /// Set the desired replica count of a function
    async fn set_replicas(&self, service: &str, count: u64) -> Result<()>;
}

/// `ServiceQuery` over the orchestrator's HTTP scale API.
///
/// Reads `GET {base}/system/scale/{name}` and writes
/// `POST {base}/system/scale/{name}` with a `{"replicas": n}` body.
pub struct HttpServiceQuery {
    base_url: String,
    client: reqwest::Client,
}

impl HttpServiceQuery {
    /// Create a query client against the orchestrator base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, service: &str) -> String {
        format!(
            "{}/system/scale/{}",
            self.base_url.trim_end_matches('/'),
            service
        )
    }
}

#[async_trait]
impl ServiceQuery for HttpServiceQuery {
    async fn get_replicas(&self, service: &str) -> Result<ServiceState> {
        let url = self.url(service);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream(format!("scale query failed for '{}': {}", service, e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Upstream(format!(
                "scale API returned {} for '{}': {}",
                status, service, body
            )));
        }

        resp.json::<ServiceState>().await.map_err(|e| {
            GatewayError::Upstream(format!(
                "failed to parse scale response for '{}': {}",
                service, e
            ))
        })
    }

    async fn set_replicas(&self, service: &str, count: u64) -> Result<()> {
        let url = self.url(service);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "replicas": count }))
            .send()
            .await
            .map_err(|e| GatewayError::Upstream(format!("scale request failed for '{}': {}", service, e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Upstream(format!(
                "scale API returned {} for '{}': {}",
                status, service, body
            )));
        }
        Ok(())
    }
}

/// A recorded `set_replicas` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleCall {
    /// Function that was scaled
    pub service: String,
    /// Requested replica count
    pub count: u64,
}

/// In-memory `ServiceQuery` that records calls (for tests and local runs)
#[derive(Default)]
pub struct MockServiceQuery {
    states: Mutex<HashMap<String, ServiceState>>,
    calls: Mutex<Vec<ScaleCall>>,
    /// Functions whose `available_replicas` never follows `replicas`
    frozen: Mutex<HashMap<String, u64>>,
    /// Functions whose queries fail
    failing: Mutex<HashMap<String, String>>,
}

impl MockServiceQuery {
    /// Create an empty mock
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the state returned for a function
    pub fn set_state(&self, service: &str, state: ServiceState) {
        self.states
            .lock()
            .unwrap()
            .insert(service.to_string(), state);
    }

    /// Pin `available_replicas` so it never converges to the desired count
    pub fn freeze_available(&self, service: &str, available: u64) {
        self.frozen
            .lock()
            .unwrap()
            .insert(service.to_string(), available);
    }

    /// Make every query for a function fail with the given message
    pub fn fail_with(&self, service: &str, message: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert(service.to_string(), message.to_string());
    }

    /// All `set_replicas` calls observed so far
    pub fn calls(&self) -> Vec<ScaleCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServiceQuery for MockServiceQuery {
    async fn get_replicas(&self, service: &str) -> Result<ServiceState> {
        if let Some(message) = self.failing.lock().unwrap().get(service) {
            return Err(GatewayError::Upstream(message.clone()));
        }
        self.states
            .lock()
            .unwrap()
            .get(service)
            .cloned()
            .ok_or_else(|| GatewayError::Upstream(format!("service {} not found", service)))
    }

    async fn set_replicas(&self, service: &str, count: u64) -> Result<()> {
        if let Some(message) = self.failing.lock().unwrap().get(service) {
            return Err(GatewayError::Upstream(message.clone()));
        }
        self.calls.lock().unwrap().push(ScaleCall {
            service: service.to_string(),
            count,
        });

        let mut states = self.states.lock().unwrap();
        let state = states.entry(service.to_string()).or_default();
        state.replicas = count;
        state.available_replicas = match self.frozen.lock().unwrap().get(service) {
            Some(pinned) => *pinned,
            None => count,
        };
        Ok(())
    }
}
