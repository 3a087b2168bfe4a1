//! Function-description payload — parsing, derived sizing, and annotation
//!
//! A deployment request declares the function image, its guaranteed
//! invocation rate, and per-invocation/per-container resource quantities.
//! This module derives the container concurrency and the replica count
//! needed to honor the declared rate, and writes the derived values back
//! into the payload before it is forwarded to the orchestrator.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{GatewayError, Result};

/// Default execution timeout when the payload leaves it unset (milliseconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 3000;

/// Default per-container CPU capacity when no limits are declared
const DEFAULT_LIMIT_CPU: &str = "1";
/// Default per-container memory capacity when no limits are declared
const DEFAULT_LIMIT_MEMORY: &str = "512Mi";

/// CPU and memory quantities, Kubernetes-style strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionResources {
    /// CPU quantity — plain cores ("1.5") or millicores ("100m")
    #[serde(default)]
    pub cpu: String,
    /// Memory quantity — raw bytes or suffixed ("512Mi", "1G")
    #[serde(default)]
    pub memory: String,
}

/// A function deployment/update request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    /// Unique function name
    pub service: String,

    /// Container image reference
    #[serde(default)]
    pub image: String,

    /// Guaranteed invocations per second; 0.0 means best-effort
    #[serde(default)]
    pub realtime: f64,

    /// Maximum execution duration in milliseconds
    #[serde(default)]
    pub timeout: u64,

    /// Per-invocation resource consumption
    pub resources: FunctionResources,

    /// Per-container capacity; defaults to {1 CPU, 512Mi} when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<FunctionResources>,

    /// Opaque labels; the gateway writes derived values back here
    #[serde(default)]
    pub labels: HashMap<String, String>,

    /// Opaque environment; the gateway writes timeout values back here
    #[serde(default, rename = "envVars")]
    pub env_vars: HashMap<String, String>,
}

impl FunctionSpec {
    /// Parse a deployment payload from raw JSON bytes
    pub fn parse(body: &[u8]) -> Result<Self> {
        let spec: Self = serde_json::from_slice(body)
            .map_err(|e| GatewayError::Spec(format!("cannot read JSON params: {}", e)))?;
        if spec.service.is_empty() {
            return Err(GatewayError::Spec("service name is empty".into()));
        }
        Ok(spec)
    }

    /// Serialize back to the wire format
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Effective execution timeout in milliseconds, defaulting when unset
    pub fn timeout_ms(&self) -> u64 {
        if self.timeout == 0 {
            DEFAULT_TIMEOUT_MS
        } else {
            self.timeout
        }
    }

    /// How many invocations one container instance can host concurrently.
    ///
    /// `⌊min(limits.cpu / resources.cpu, limits.memory / resources.memory)⌋`,
    /// never below 1. Fails when either per-invocation quantity is zero or
    /// a quantity cannot be parsed.
    pub fn concurrency(&self) -> Result<u64> {
        let limits = self.effective_limits();

        let container_cpu = parse_cpu_quantity(&limits.cpu)?;
        let container_memory = parse_memory_quantity(&limits.memory)?;
        let func_cpu = parse_cpu_quantity(&self.resources.cpu)?;
        let func_memory = parse_memory_quantity(&self.resources.memory)?;

        if func_cpu == 0.0 || func_memory == 0.0 {
            return Err(GatewayError::Resource(
                "function resources must be non-zero".into(),
            ));
        }

        let size_cpu = (container_cpu / func_cpu).floor();
        let size_memory = (container_memory / func_memory).floor();
        let size = size_cpu.min(size_memory) as u64;
        Ok(size.max(1))
    }

    /// Replicas needed to sustain the declared rate.
    ///
    /// `max(1, ⌈realtime × timeout_seconds / concurrency⌉)` for real-time
    /// functions; 0 for best-effort ones (the orchestrator default applies).
    pub fn required_replicas(&self) -> Result<u64> {
        if self.realtime <= 0.0 {
            return Ok(0);
        }
        let concurrency = self.concurrency()?;
        let timeout_secs = self.timeout_ms() as f64 / 1000.0;
        let required = (self.realtime * timeout_secs / concurrency as f64).ceil() as u64;
        Ok(required.max(1))
    }

    /// Write the derived values back into the payload.
    ///
    /// Labels gain `realtime`, `concurrency`, `timeout`; the environment
    /// gains `exec_timeout`, `read_timeout`, `write_timeout`. The effective
    /// timeout is also materialized into the `timeout` field.
    pub fn annotate(&mut self) -> Result<()> {
        let concurrency = self.concurrency()?;
        self.timeout = self.timeout_ms();
        let timeout = self.timeout.to_string();

        self.labels
            .insert("realtime".to_string(), format!("{}", self.realtime));
        self.labels
            .insert("concurrency".to_string(), concurrency.to_string());
        self.labels.insert("timeout".to_string(), timeout.clone());

        self.env_vars
            .insert("exec_timeout".to_string(), timeout.clone());
        self.env_vars
            .insert("read_timeout".to_string(), timeout.clone());
        self.env_vars.insert("write_timeout".to_string(), timeout);

        Ok(())
    }

    fn effective_limits(&self) -> FunctionResources {
        self.limits.clone().unwrap_or(FunctionResources {
            cpu: DEFAULT_LIMIT_CPU.to_string(),
            memory: DEFAULT_LIMIT_MEMORY.to_string(),
        })
    }
}

/// Parse a CPU quantity: plain cores ("1.5") or millicores ("100m")
pub fn parse_cpu_quantity(value: &str) -> Result<f64> {
    let value = value.trim();
    if value.is_empty() {
        return Err(GatewayError::Resource("empty CPU quantity".into()));
    }
    if let Some(milli) = value.strip_suffix('m') {
        let parsed: f64 = milli
            .parse()
            .map_err(|_| GatewayError::Resource(format!("invalid CPU quantity '{}'", value)))?;
        return Ok(parsed / 1000.0);
    }
    value
        .parse()
        .map_err(|_| GatewayError::Resource(format!("invalid CPU quantity '{}'", value)))
}

/// Parse a memory quantity: raw bytes or suffixed with `k/M/G/T` (decimal)
/// or `Ki/Mi/Gi/Ti` (binary)
pub fn parse_memory_quantity(value: &str) -> Result<f64> {
    let value = value.trim();
    if value.is_empty() {
        return Err(GatewayError::Resource("empty memory quantity".into()));
    }

    const SUFFIXES: &[(&str, f64)] = &[
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
    ];

    for (suffix, multiplier) in SUFFIXES {
        if let Some(number) = value.strip_suffix(suffix) {
            let parsed: f64 = number.trim().parse().map_err(|_| {
                GatewayError::Resource(format!("invalid memory quantity '{}'", value))
            })?;
            return Ok(parsed * multiplier);
        }
    }

    value
        .parse()
        .map_err(|_| GatewayError::Resource(format!("invalid memory quantity '{}'", value)))
}
