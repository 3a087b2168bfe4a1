//! Invocation admission gate — the hot path in front of every forwarded
//! request
//!
//! Consults the function cache for the declared rate and applies the
//! credit-based pacer. Unknown functions fail open: the absence of scaling
//! state is never a rejection condition, so a cache miss that also cannot
//! be refreshed from the orchestrator admits the request unpaced.

use std::time::{Duration, Instant};

use crate::scaling::Scaler;

/// Divisor applied to the target interval for the single retry sleep.
///
/// The sleep exists to desynchronize contending callers, not to wait out a
/// full interval; it has no principled relationship to `1/realtime` and is
/// kept deliberately small so rejected callers are rejected quickly.
pub const RETRY_SPREAD_FACTOR: f64 = 100.0;

/// How many times a rejected invocation is retried after the spread sleep
const RETRY_LIMIT: u32 = 1;

/// Result of the admission gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Forward the request downstream
    Admit,
    /// The declared rate is exhausted; respond 408
    RateLimited,
}

/// Decide whether an invocation of `name` may proceed.
///
/// A call id present in the bypass set was already admitted at
/// async-enqueue time and passes straight through without touching the
/// pacer again.
pub async fn check_admission(scaler: &Scaler, name: &str, call_id: Option<&str>) -> GateDecision {
    if let Some(id) = call_id {
        if scaler.bypass.take(id) {
            return GateDecision::Admit;
        }
    }

    let mut tries = 0u32;
    loop {
        let invoke_time = Instant::now();
        let (mut state, fresh) = scaler.cache.get(name);
        if !fresh {
            match scaler.query.get_replicas(name).await {
                Ok(fetched) => {
                    scaler.cache.set(name, fetched.clone());
                    state = fetched;
                }
                Err(e) => {
                    tracing::debug!(function = name, error = %e, "no scaling state, admitting");
                    return GateDecision::Admit;
                }
            }
        }

        if state.realtime == 0.0 {
            // Best-effort function, no guarantee to enforce
            return GateDecision::Admit;
        }

        let (admitted, _gap) = scaler.cache.update_invocation(name, invoke_time);
        if admitted {
            return GateDecision::Admit;
        }
        if tries >= RETRY_LIMIT {
            return GateDecision::RateLimited;
        }
        tries += 1;

        // Spread out contending callers before the single retry
        let wait = 1.0 / (RETRY_SPREAD_FACTOR * state.realtime);
        tokio::time::sleep(Duration::from_secs_f64(wait)).await;
    }
}
