//! Configuration types for the real-time gateway
//!
//! The gateway is tuned through a JSON config file, with a handful of
//! environment overrides kept compatible with the classic deployment
//! (`set_scale_retries`, `max_poll_count`, `function_poll_interval`,
//! `write_request_uri`).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{GatewayError, Result};

/// Top-level gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listen address for the gateway entrypoint
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Base URL of the orchestrator-facing endpoint all requests forward to
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,

    /// Deadline in seconds for each outbound proxy request
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,

    /// Attempts for the SetReplicas linear backoff during a scale operation
    #[serde(default = "default_set_scale_retries")]
    pub set_scale_retries: u64,

    /// Replica poll iterations after a successful SetReplicas
    #[serde(default = "default_max_poll_count")]
    pub max_poll_count: u64,

    /// Milliseconds between scale retries and replica polls
    #[serde(default = "default_function_poll_interval")]
    pub function_poll_interval_ms: u64,

    /// Milliseconds between availability polls while waiting for replicas
    #[serde(default = "default_wait_interval")]
    pub wait_interval_ms: u64,

    /// Seconds a cached function entry stays fresh
    #[serde(default = "default_cache_expiry")]
    pub cache_expiry_secs: u64,

    /// Capacity of each per-function sync/async invocation channel
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Log every upstream request URI (verbose)
    #[serde(default)]
    pub write_request_uri: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            upstream_url: default_upstream_url(),
            upstream_timeout_secs: default_upstream_timeout(),
            set_scale_retries: default_set_scale_retries(),
            max_poll_count: default_max_poll_count(),
            function_poll_interval_ms: default_function_poll_interval(),
            wait_interval_ms: default_wait_interval(),
            cache_expiry_secs: default_cache_expiry(),
            queue_capacity: default_queue_capacity(),
            write_request_uri: false,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a JSON file
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| GatewayError::Config(format!("Invalid config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides on top of the file/default values
    pub fn apply_env(&mut self) {
        if let Some(v) = env_u64("set_scale_retries") {
            self.set_scale_retries = v;
        }
        if let Some(v) = env_u64("max_poll_count") {
            self.max_poll_count = v;
        }
        if let Some(v) = env_u64("function_poll_interval") {
            self.function_poll_interval_ms = v;
        }
        if std::env::var_os("write_request_uri").is_some() {
            self.write_request_uri = true;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.function_poll_interval_ms == 0 {
            return Err(GatewayError::Config(
                "function_poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(GatewayError::Config(
                "queue_capacity must be greater than zero".into(),
            ));
        }
        if self.set_scale_retries == 0 {
            return Err(GatewayError::Config(
                "set_scale_retries must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Outbound proxy deadline
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    /// Interval between scale retries and replica polls
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.function_poll_interval_ms)
    }

    /// Interval between availability polls
    pub fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.wait_interval_ms)
    }

    /// Cache freshness window
    pub fn cache_expiry(&self) -> Duration {
        Duration::from_secs(self.cache_expiry_secs)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_upstream_url() -> String {
    "http://127.0.0.1:8081".to_string()
}

fn default_upstream_timeout() -> u64 {
    30
}

fn default_set_scale_retries() -> u64 {
    5
}

fn default_max_poll_count() -> u64 {
    100
}

fn default_function_poll_interval() -> u64 {
    100
}

fn default_wait_interval() -> u64 {
    1000
}

fn default_cache_expiry() -> u64 {
    5
}

fn default_queue_capacity() -> usize {
    200
}
