//! Per-function invocation scheduling — cooperative release at the
//! declared rate
//!
//! Every real-time function owns an independent scheduler task with two
//! bounded channels (synchronous and asynchronous invocations) and a ticker
//! firing once per target interval `I = 1/realtime`. On each tick one
//! pending invocation is released, async traffic first. Callers block on a
//! single-shot completion latch until their invocation has been dispatched
//! and the downstream response collected. Enqueueing never blocks: a full
//! channel rejects immediately.

use bytes::Bytes;
use http::{HeaderMap, Method};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;

use crate::error::{GatewayError, Result};
use crate::proxy::{ProxyClient, UpstreamResponse};
use crate::spec::FunctionSpec;

/// Ticker period used while a handler has no declared rate. The loop still
/// runs so control messages are honored, but nothing is released.
const IDLE_INTERVAL_SECS: f64 = 3600.0;

/// A request captured for deferred dispatch by a scheduler
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    /// Original HTTP method
    pub method: Method,
    /// Path and query forwarded downstream
    pub path_and_query: String,
    /// Client headers
    pub headers: HeaderMap,
    /// Client address for X-Forwarded-For
    pub client_addr: Option<String>,
    /// Host header for X-Forwarded-Host
    pub host: Option<String>,
    /// Request body
    pub body: Bytes,
}

/// A pending invocation: the captured request plus the caller's latch
struct Invocation {
    request: InvocationRequest,
    done: oneshot::Sender<Result<UpstreamResponse>>,
}

/// Outcome of pushing an invocation through a function's scheduler
#[derive(Debug)]
pub enum InvokeOutcome {
    /// No scheduler owns this function (or it is best-effort); the caller
    /// forwards directly without pacing
    Unmanaged,
    /// The invocation channel is full
    Rejected,
    /// The scheduler released the invocation and collected the response
    Completed(Result<UpstreamResponse>),
}

struct FunctionHandler {
    realtime: RwLock<f64>,
    sync_tx: mpsc::Sender<Invocation>,
    async_tx: mpsc::Sender<Invocation>,
    /// Pre-issued async call ids awaiting their request, with enqueue time
    waiting: Mutex<HashMap<String, Instant>>,
    stop_tx: watch::Sender<bool>,
    update_tx: watch::Sender<f64>,
}

/// Registry of per-function schedulers
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<FunctionHandler>>>,
    proxy: Arc<ProxyClient>,
    base_url: String,
    capacity: usize,
}

impl HandlerRegistry {
    /// Create a registry dispatching through `proxy` to `base_url`
    pub fn new(proxy: Arc<ProxyClient>, base_url: impl Into<String>, capacity: usize) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            proxy,
            base_url: base_url.into(),
            capacity,
        }
    }

    /// Create the scheduler for a new function, or retune an existing one.
    ///
    /// Reconfiguration swaps the ticker interval through the update channel
    /// without tearing down the queues.
    pub fn set_function_handler(&self, spec: &FunctionSpec) {
        let name = spec.service.as_str();
        let mut handlers = self.handlers.write().unwrap();

        if let Some(handler) = handlers.get(name) {
            tracing::info!(function = name, "handler already exists, updating");
            *handler.realtime.write().unwrap() = spec.realtime;
            let _ = handler.update_tx.send(interval_secs(spec.realtime));
            return;
        }

        tracing::info!(function = name, realtime = spec.realtime, "adding handler entry");
        let (sync_tx, sync_rx) = mpsc::channel(self.capacity);
        let (async_tx, async_rx) = mpsc::channel(self.capacity);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (update_tx, update_rx) = watch::channel(interval_secs(spec.realtime));

        let handler = FunctionHandler {
            realtime: RwLock::new(spec.realtime),
            sync_tx,
            async_tx,
            waiting: Mutex::new(HashMap::new()),
            stop_tx,
            update_tx,
        };
        handlers.insert(name.to_string(), Arc::new(handler));

        tokio::spawn(run_scheduler(
            name.to_string(),
            self.proxy.clone(),
            self.base_url.clone(),
            sync_rx,
            async_rx,
            stop_rx,
            update_rx,
            interval_secs(spec.realtime),
        ));
    }

    /// Stop a function's scheduler and drop its queues
    pub fn remove_function_handler(&self, name: &str) {
        let removed = self.handlers.write().unwrap().remove(name);
        match removed {
            Some(handler) => {
                let _ = handler.stop_tx.send(true);
                tracing::info!(function = name, "handler removed");
            }
            None => {
                tracing::debug!(function = name, "no handler to remove");
            }
        }
    }

    /// Reserve an async slot for a call id.
    ///
    /// Checks channel headroom without enqueueing; the actual enqueue
    /// happens later when the request arrives carrying the same call id.
    pub fn async_invoke(&self, name: &str, call_id: &str) -> Result<()> {
        let handler = self
            .handlers
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::HandlerNotFound(name.to_string()))?;

        if *handler.realtime.read().unwrap() <= 0.0 {
            return Ok(());
        }
        if handler.async_tx.capacity() == 0 {
            return Err(GatewayError::QueueFull(format!(
                "too many invocations for {}",
                name
            )));
        }
        handler
            .waiting
            .lock()
            .unwrap()
            .insert(call_id.to_string(), Instant::now());
        Ok(())
    }

    /// Enqueue an invocation and block until the scheduler releases it.
    ///
    /// A call id found in the waiting set routes to the async channel,
    /// anything else to the sync channel; both pushes are non-blocking.
    pub async fn invoke(
        &self,
        name: &str,
        call_id: Option<&str>,
        request: InvocationRequest,
    ) -> InvokeOutcome {
        let handler = match self.handlers.read().unwrap().get(name).cloned() {
            Some(handler) => handler,
            None => {
                tracing::debug!(function = name, "function handler not found");
                return InvokeOutcome::Unmanaged;
            }
        };

        if *handler.realtime.read().unwrap() <= 0.0 {
            return InvokeOutcome::Unmanaged;
        }

        let (done_tx, done_rx) = oneshot::channel();
        let invocation = Invocation {
            request,
            done: done_tx,
        };

        let is_async = call_id
            .map(|id| handler.waiting.lock().unwrap().remove(id).is_some())
            .unwrap_or(false);

        let sent = if is_async {
            handler.async_tx.try_send(invocation)
        } else {
            handler.sync_tx.try_send(invocation)
        };

        if sent.is_err() {
            tracing::warn!(function = name, is_async, "invocation queue full");
            return InvokeOutcome::Rejected;
        }

        match done_rx.await {
            Ok(result) => InvokeOutcome::Completed(result),
            Err(_) => InvokeOutcome::Completed(Err(GatewayError::Upstream(
                "scheduler dropped invocation".into(),
            ))),
        }
    }

    /// Whether a scheduler exists for the function
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().unwrap().contains_key(name)
    }

    /// Number of registered schedulers
    pub fn len(&self) -> usize {
        self.handlers.read().unwrap().len()
    }

    /// Whether any scheduler is registered
    pub fn is_empty(&self) -> bool {
        self.handlers.read().unwrap().is_empty()
    }

    /// Remaining async channel capacity for a function
    pub fn async_headroom(&self, name: &str) -> Option<usize> {
        self.handlers
            .read()
            .unwrap()
            .get(name)
            .map(|handler| handler.async_tx.capacity())
    }
}

fn interval_secs(realtime: f64) -> f64 {
    if realtime > 0.0 {
        1.0 / realtime
    } else {
        IDLE_INTERVAL_SECS
    }
}

fn make_ticker(interval: f64) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(interval));
    // Missed ticks collapse instead of bursting after an idle period
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

#[allow(clippy::too_many_arguments)]
async fn run_scheduler(
    name: String,
    proxy: Arc<ProxyClient>,
    base_url: String,
    mut sync_rx: mpsc::Receiver<Invocation>,
    mut async_rx: mpsc::Receiver<Invocation>,
    mut stop_rx: watch::Receiver<bool>,
    mut update_rx: watch::Receiver<f64>,
    initial_interval: f64,
) {
    let mut ticker = make_ticker(initial_interval);
    let mut last_release = Instant::now();

    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                tracing::info!(function = %name, "handler stops");
                return;
            }
            changed = update_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                let interval = *update_rx.borrow_and_update();
                tracing::info!(function = %name, interval, "update handler timing");
                ticker = make_ticker(interval);
            }
            _ = ticker.tick() => {
                let invocation = match async_rx.try_recv() {
                    Ok(invocation) => {
                        tracing::debug!(
                            function = %name,
                            waited_ms = last_release.elapsed().as_millis() as u64,
                            "releasing async invocation"
                        );
                        Some(invocation)
                    }
                    Err(_) => sync_rx.try_recv().ok(),
                };

                if let Some(invocation) = invocation {
                    last_release = Instant::now();
                    let proxy = proxy.clone();
                    let base_url = base_url.clone();
                    tokio::spawn(async move {
                        let req = invocation.request;
                        let result = proxy
                            .forward(
                                &req.method,
                                &base_url,
                                &req.path_and_query,
                                &req.headers,
                                req.client_addr.as_deref(),
                                req.host.as_deref(),
                                req.body,
                            )
                            .await;
                        let _ = invocation.done.send(result);
                    });
                }
            }
        }
    }
}
