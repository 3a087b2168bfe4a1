//! # rt-gateway
//!
//! Real-time admission and invocation control core for a FaaS gateway.
//! Functions declare a guaranteed invocation rate (`realtime`, in
//! invocations per second); the gateway reserves enough container replicas
//! to honor it at deployment time and paces invocations to it at runtime.
//!
//! ## Architecture
//!
//! ```text
//! Lifecycle:  client → AdmissionControl → ResourceManager → orchestrator
//! Invocation: client → admission gate → per-function scheduler → upstream
//! ```
//!
//! ## Core pieces
//!
//! - **FunctionCache**: per-function scaling metadata plus the bounded
//!   smoothness credit that absorbs jitter without allowing sustained
//!   over-rate traffic
//! - **ServiceQuery**: the narrow replica read/write contract any
//!   orchestrator satisfies
//! - **ResourceManager**: image lifecycle forwarding plus the
//!   scale-and-wait replica protocol
//! - **ReserveAdmission**: transactional register/update/unregister with
//!   rollback when capacity cannot be reserved
//! - **HandlerRegistry**: per-function schedulers releasing queued
//!   invocations at the declared interval
//! - **workflow**: the companion watchdog executing declared task chains
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use rt_gateway::config::GatewayConfig;
//! use rt_gateway::scaling::HttpServiceQuery;
//! use rt_gateway::server::{serve, AppState};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> rt_gateway::Result<()> {
//!     let config = GatewayConfig::default();
//!     let query = Arc::new(HttpServiceQuery::new(config.upstream_url.clone()));
//!     let state = Arc::new(AppState::new(config, query));
//!     let (_addr, handle) = serve(state).await?;
//!     handle.await.ok();
//!     Ok(())
//! }
//! ```

pub mod admission;
pub mod config;
pub mod error;
pub mod invoke;
pub mod manager;
pub mod proxy;
pub mod queue;
pub mod scaling;
pub mod server;
pub mod spec;
pub mod workflow;

// Re-export main types
pub use error::{GatewayError, Result};
pub use server::AppState;
pub use spec::FunctionSpec;
