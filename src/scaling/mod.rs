//! Scaling — function cache, orchestrator replica queries, and the
//! process-wide scaler state
//!
//! The cache holds per-function scaling metadata plus the rate-shaping
//! state consulted on every invocation. The `ServiceQuery` trait is the
//! narrow contract any orchestrator backend satisfies.

pub mod cache;
pub mod query;
pub mod scaler;

pub use cache::FunctionCache;
pub use query::{HttpServiceQuery, MockServiceQuery, ServiceQuery, ServiceState};
pub use scaler::{BypassSet, Scaler, ScalerSettings};
