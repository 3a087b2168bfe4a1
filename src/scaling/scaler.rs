//! Scaler — the process-wide scaling state, owned explicitly
//!
//! One instance is created at startup and shared by reference. The
//! orchestrator backend is injected through the `ServiceQuery` trait so
//! tests can substitute an in-memory implementation.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::cache::FunctionCache;
use super::query::ServiceQuery;
use crate::config::GatewayConfig;

/// Scaling knobs consulted by the resource manager
#[derive(Debug, Clone)]
pub struct ScalerSettings {
    /// Attempts for the SetReplicas linear backoff
    pub set_scale_retries: u64,
    /// Replica poll iterations after SetReplicas succeeds
    pub max_poll_count: u64,
    /// Interval between scale retries and replica polls
    pub poll_interval: Duration,
    /// Interval between availability polls
    pub wait_interval: Duration,
}

impl ScalerSettings {
    /// Extract the scaling knobs from the gateway configuration
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            set_scale_retries: config.set_scale_retries,
            max_poll_count: config.max_poll_count,
            poll_interval: config.poll_interval(),
            wait_interval: config.wait_interval(),
        }
    }
}

impl Default for ScalerSettings {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

/// Call ids that already passed admission at async-enqueue time.
///
/// When the queued request is later delivered to the invocation path it
/// must not be accounted against the function's rate a second time, so the
/// gate pops the id and admits directly.
#[derive(Default)]
pub struct BypassSet {
    inner: Mutex<HashSet<String>>,
}

impl BypassSet {
    /// Record a pre-admitted call id
    pub fn insert(&self, call_id: &str) {
        self.inner.lock().unwrap().insert(call_id.to_string());
    }

    /// Remove a call id, returning whether it was present
    pub fn take(&self, call_id: &str) -> bool {
        self.inner.lock().unwrap().remove(call_id)
    }

    /// Number of in-flight pre-admitted ids
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

/// Process-wide scaling state: cache, orchestrator contract, bypass set
pub struct Scaler {
    /// Function cache (C1)
    pub cache: FunctionCache,
    /// Orchestrator replica contract (C2)
    pub query: Arc<dyn ServiceQuery>,
    /// Pre-admitted async call ids
    pub bypass: BypassSet,
    /// Scaling knobs
    pub settings: ScalerSettings,
}

impl Scaler {
    /// Create the scaler with an injected orchestrator backend
    pub fn new(query: Arc<dyn ServiceQuery>, cache_expiry: Duration, settings: ScalerSettings) -> Self {
        Self {
            cache: FunctionCache::new(cache_expiry),
            query,
            bypass: BypassSet::default(),
            settings,
        }
    }
}
