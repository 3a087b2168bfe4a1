//! Admission control — function registration, update, and removal with
//! reservation semantics
//!
//! The Reserve policy guarantees a declared invocation rate by reserving
//! replicas at deployment time: the image operation goes upstream first,
//! then the orchestrator is driven to the required replica count and the
//! deployment is rolled back if capacity cannot be reserved. Image-level
//! failures are surfaced verbatim — the orchestrator is the source of
//! truth for image state — while scale-level failures are recovered by
//! rollback.

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use std::sync::Arc;

use crate::manager::ResourceManager;
use crate::proxy::UpstreamResponse;
use crate::queue::HandlerRegistry;
use crate::spec::FunctionSpec;

/// Inbound request surface handed to an admission policy
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    /// Path (and query) forwarded to the orchestrator endpoint
    pub path: String,
    /// Function name when the route carries one (unregister)
    pub name: Option<String>,
    /// Client headers
    pub headers: HeaderMap,
    /// Client address for X-Forwarded-For
    pub client_addr: Option<String>,
    /// Host header for X-Forwarded-Host
    pub host: Option<String>,
    /// Request body
    pub body: Bytes,
}

/// Response produced by an admission policy
#[derive(Debug)]
pub struct AdmissionResponse {
    /// HTTP status returned to the client
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

impl AdmissionResponse {
    /// 202 Accepted with an empty body
    pub fn accepted() -> Self {
        Self {
            status: StatusCode::ACCEPTED,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// A plain-text error response
    pub fn error(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::from(message.into()),
        }
    }

    /// Pass an upstream response through verbatim
    pub fn from_upstream(res: UpstreamResponse) -> Self {
        Self {
            status: res.status,
            headers: res.headers,
            body: res.body,
        }
    }
}

/// Admission control contract for deployment, update, and deletion.
///
/// Reserve is the only policy today; the trait is the seam a future
/// best-effort policy plugs into without touching the HTTP handlers.
#[async_trait]
pub trait AdmissionControl: Send + Sync {
    /// Deploy a new function
    async fn register(&self, req: AdmissionRequest) -> AdmissionResponse;
    /// Update an existing function
    async fn update(&self, req: AdmissionRequest) -> AdmissionResponse;
    /// Remove a function
    async fn unregister(&self, req: AdmissionRequest) -> AdmissionResponse;
}

/// Reservation-based admission control
pub struct ReserveAdmission {
    manager: Arc<ResourceManager>,
    handlers: Arc<HandlerRegistry>,
}

impl ReserveAdmission {
    /// Create the Reserve policy over the given resource manager
    pub fn new(manager: Arc<ResourceManager>, handlers: Arc<HandlerRegistry>) -> Self {
        Self { manager, handlers }
    }

    /// Attempts used when waiting for `replicas` to become available
    fn wait_attempts(replicas: u64) -> u64 {
        (2 * replicas).max(10)
    }

    fn parse_and_annotate(body: &[u8]) -> Result<(FunctionSpec, u64), AdmissionResponse> {
        let mut spec = FunctionSpec::parse(body).map_err(|e| {
            tracing::error!(error = %e, "reading parameters failed");
            AdmissionResponse::error(StatusCode::NOT_FOUND, "function parameters are invalid")
        })?;
        spec.annotate().map_err(|e| {
            tracing::error!(error = %e, "reading parameters failed");
            AdmissionResponse::error(StatusCode::NOT_FOUND, "function parameters are invalid")
        })?;
        let required = spec.required_replicas().map_err(|e| {
            tracing::error!(error = %e, "reading parameters failed");
            AdmissionResponse::error(StatusCode::NOT_FOUND, "function parameters are invalid")
        })?;
        Ok((spec, required))
    }

    async fn reserve_capacity(&self, name: &str, required: u64) -> bool {
        if let Err(e) = self.manager.scale(name, required).await {
            tracing::error!(function = name, error = %e, "scale failed");
            return false;
        }
        self.manager
            .wait_for_available(
                name,
                required,
                Self::wait_attempts(required),
                self.manager.scaler().settings.wait_interval,
            )
            .await
    }
}

#[async_trait]
impl AdmissionControl for ReserveAdmission {
    async fn register(&self, req: AdmissionRequest) -> AdmissionResponse {
        let (spec, required) = match Self::parse_and_annotate(&req.body) {
            Ok(parsed) => parsed,
            Err(response) => return response,
        };
        let body = match spec.to_bytes() {
            Ok(body) => body,
            Err(e) => {
                return AdmissionResponse::error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };

        let upstream = self
            .manager
            .create_image(
                &req.path,
                &req.headers,
                req.client_addr.as_deref(),
                req.host.as_deref(),
                body,
            )
            .await;
        match upstream {
            Err(e) => {
                return AdmissionResponse::error(e.status_code(), e.to_string());
            }
            Ok(res) if !res.status.is_success() => {
                return AdmissionResponse::from_upstream(res);
            }
            Ok(_) => {}
        }

        let name = spec.service.as_str();
        if spec.realtime > 0.0 {
            tracing::info!(function = name, replicas = required, "reserving replicas");
            if !self.reserve_capacity(name, required).await {
                // Deployment cannot honor the declared rate: undo it.
                let rollback = self
                    .manager
                    .remove_image(
                        &req.path,
                        &req.headers,
                        req.client_addr.as_deref(),
                        req.host.as_deref(),
                        req.body.clone(),
                    )
                    .await;
                if let Err(e) = rollback {
                    tracing::error!(function = name, error = %e, "unable to rollback deployment");
                }
                return AdmissionResponse::error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "insufficient resources, cancel deployment",
                );
            }
        } else if let Err(e) = self.manager.get_realtime_params(name).await {
            tracing::debug!(function = name, error = %e, "cache warm-up skipped");
        }

        self.handlers.set_function_handler(&spec);
        AdmissionResponse::accepted()
    }

    async fn update(&self, req: AdmissionRequest) -> AdmissionResponse {
        let (spec, required) = match Self::parse_and_annotate(&req.body) {
            Ok(parsed) => parsed,
            Err(response) => return response,
        };
        let name = spec.service.clone();

        // Capture the current parameters in case rollback is needed.
        let prev = match self.manager.get_realtime_params(&name).await {
            Ok(prev) => prev,
            Err(e) => {
                tracing::error!(function = %name, error = %e, "cannot read current deployment");
                return AdmissionResponse::error(StatusCode::NOT_FOUND, e.to_string());
            }
        };

        let body = match spec.to_bytes() {
            Ok(body) => body,
            Err(e) => {
                return AdmissionResponse::error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        let upstream = self
            .manager
            .update_image(
                &req.path,
                &req.headers,
                req.client_addr.as_deref(),
                req.host.as_deref(),
                body,
            )
            .await;
        match upstream {
            Err(e) => {
                return AdmissionResponse::error(e.status_code(), e.to_string());
            }
            Ok(res) if !res.status.is_success() => {
                return AdmissionResponse::from_upstream(res);
            }
            Ok(_) => {}
        }

        if prev.realtime > 0.0 || spec.realtime > 0.0 {
            let mut ok = match self.manager.scale(&name, required).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!(function = %name, error = %e, "scale failed");
                    false
                }
            };
            if ok {
                if prev.realtime < spec.realtime {
                    // Only a scale-up needs to be observed; releasing
                    // surplus replicas completes on its own.
                    ok = self
                        .manager
                        .wait_for_available(
                            &name,
                            required,
                            Self::wait_attempts(required),
                            self.manager.scaler().settings.wait_interval,
                        )
                        .await;
                }
            }

            if !ok {
                self.rollback_update(&req, &spec, &prev).await;
                return AdmissionResponse::error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "insufficient resources, cancel update",
                );
            }
        }

        self.handlers.set_function_handler(&spec);
        AdmissionResponse::accepted()
    }

    async fn unregister(&self, req: AdmissionRequest) -> AdmissionResponse {
        let upstream = self
            .manager
            .remove_image(
                &req.path,
                &req.headers,
                req.client_addr.as_deref(),
                req.host.as_deref(),
                req.body.clone(),
            )
            .await;
        match &upstream {
            Err(e) => {
                tracing::error!(path = %req.path, error = %e, "remove image failed");
            }
            Ok(res) if !res.status.is_success() => {
                tracing::error!(path = %req.path, status = %res.status, "remove image failed");
            }
            Ok(_) => {}
        }

        if let Some(name) = &req.name {
            self.manager.scaler().cache.delete(name);
            self.handlers.remove_function_handler(name);
        }

        // Removal is idempotent from the admission-control view.
        AdmissionResponse::accepted()
    }
}

impl ReserveAdmission {
    /// Best-effort restoration of the pre-update deployment.
    ///
    /// Failures here leave the function in an inconsistent state; they are
    /// logged for human intervention, never propagated.
    async fn rollback_update(
        &self,
        req: &AdmissionRequest,
        new_spec: &FunctionSpec,
        prev: &crate::scaling::ServiceState,
    ) {
        let name = new_spec.service.as_str();

        let mut prev_spec = new_spec.clone();
        prev_spec.realtime = prev.realtime;
        if prev.timeout > 0 {
            prev_spec.timeout = prev.timeout;
        }
        if let Err(e) = prev_spec.annotate() {
            tracing::error!(function = name, error = %e, "unable to restore previous params");
        }

        match prev_spec.to_bytes() {
            Ok(body) => {
                if let Err(e) = self
                    .manager
                    .update_image(
                        &req.path,
                        &req.headers,
                        req.client_addr.as_deref(),
                        req.host.as_deref(),
                        body,
                    )
                    .await
                {
                    tracing::error!(function = name, error = %e, "unable to rollback update");
                }
            }
            Err(e) => {
                tracing::error!(function = name, error = %e, "unable to rollback update");
            }
        }

        if let Err(e) = self.manager.scale(name, prev.replicas).await {
            tracing::error!(function = name, error = %e, "unable to rollback scale");
        }
        let scaled_back = self
            .manager
            .wait_for_available(
                name,
                prev.replicas,
                Self::wait_attempts(prev.replicas),
                self.manager.scaler().settings.wait_interval,
            )
            .await;
        if !scaled_back {
            tracing::error!(function = name, "unable to scale back after update");
        }
    }
}
