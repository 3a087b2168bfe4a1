//! Function cache — per-function scaling metadata and rate-shaping state
//!
//! Invocation requests arrive from remote clients and fast-rate traffic
//! experiences jitter, so the admission decision cannot demand an exact
//! inter-arrival interval. Each entry carries a bounded smoothness credit
//! measured in seconds: an invocation arriving later than the target
//! interval `I = 1/realtime` earns credit, one arriving early spends it,
//! and the credit is clamped to `[-1.5·I, +1.5·I]`. Early arrivals are
//! admitted while the spent credit stays above the lower bound, so small
//! jitter passes through but a sustained over-rate burst cannot.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use super::query::ServiceState;

/// Smoothness credit bound as a multiple of the target interval
const SMOOTHNESS_BOUND_FACTOR: f64 = 1.5;

/// Cached metadata for one function
#[derive(Debug, Clone)]
struct FunctionMeta {
    /// When the orchestrator state was last refreshed
    last_refresh: Instant,
    /// Latest orchestrator state
    state: ServiceState,
    /// Most recent admitted invocation
    last_admission: Option<Instant>,
    /// Rate-shaping credit in seconds, bounded by `±1.5·I`
    smoothness: f64,
}

/// Process-wide cache of function scaling state
pub struct FunctionCache {
    entries: RwLock<HashMap<String, FunctionMeta>>,
    expiry: Duration,
}

impl FunctionCache {
    /// Create a cache whose entries stay fresh for `expiry`
    pub fn new(expiry: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            expiry,
        }
    }

    /// Upsert the orchestrator state for a function.
    ///
    /// The rate-shaping state (`last_admission`, `smoothness`) survives
    /// refreshes; only the snapshot and its timestamp are replaced.
    pub fn set(&self, name: &str, state: ServiceState) {
        let mut entries = self.entries.write().unwrap();
        let now = Instant::now();
        match entries.get_mut(name) {
            Some(meta) => {
                meta.last_refresh = now;
                meta.state = state;
            }
            None => {
                entries.insert(
                    name.to_string(),
                    FunctionMeta {
                        last_refresh: now,
                        state,
                        last_admission: None,
                        smoothness: 0.0,
                    },
                );
            }
        }
    }

    /// Snapshot read. The second value is false when the entry is missing
    /// or older than the expiry window.
    pub fn get(&self, name: &str) -> (ServiceState, bool) {
        let entries = self.entries.read().unwrap();
        match entries.get(name) {
            Some(meta) => {
                let fresh = meta.last_refresh.elapsed() < self.expiry;
                (meta.state.clone(), fresh)
            }
            None => (ServiceState::default(), false),
        }
    }

    /// The rate-shaping decision for a candidate invocation at `now`.
    ///
    /// Returns `(admitted, gap)` where `gap` is the distance to the most
    /// recent admitted invocation. Functions without an entry or with
    /// `realtime == 0` are admitted unconditionally and their state is not
    /// touched. Rejections leave the entry unchanged.
    pub fn update_invocation(&self, name: &str, now: Instant) -> (bool, Duration) {
        let mut entries = self.entries.write().unwrap();
        let meta = match entries.get_mut(name) {
            Some(meta) => meta,
            None => return (true, Duration::ZERO),
        };
        if meta.state.realtime <= 0.0 {
            return (true, Duration::ZERO);
        }

        let last = match meta.last_admission {
            Some(last) => last,
            None => {
                // First observed invocation anchors the pacer
                meta.last_admission = Some(now);
                return (true, Duration::ZERO);
            }
        };

        let interval = 1.0 / meta.state.realtime;
        let bound = SMOOTHNESS_BOUND_FACTOR * interval;
        let gap = now.saturating_duration_since(last);
        let diff = gap.as_secs_f64() - interval;

        if diff >= 0.0 || meta.smoothness + diff > -bound {
            meta.last_admission = Some(now);
            meta.smoothness = (meta.smoothness + diff).clamp(-bound, bound);
            (true, gap)
        } else {
            (false, gap)
        }
    }

    /// Remove a function from the cache
    pub fn delete(&self, name: &str) {
        self.entries.write().unwrap().remove(name);
    }

    /// Number of cached functions
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    #[cfg(test)]
    fn smoothness(&self, name: &str) -> Option<f64> {
        self.entries
            .read()
            .unwrap()
            .get(name)
            .map(|meta| meta.smoothness)
    }
}
