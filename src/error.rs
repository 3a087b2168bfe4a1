//! Centralized error types for the real-time gateway

use http::StatusCode;
use thiserror::Error;

/// Gateway error types
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration file parsing or validation failed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Function-description payload could not be parsed
    #[error("Invalid function specification: {0}")]
    Spec(String),

    /// Function resources are zero or a quantity is unparseable
    #[error("Invalid function resources: {0}")]
    Resource(String),

    /// Transport-level failure talking to the orchestrator
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Scale or availability wait failed after retries
    #[error("Capacity error: {0}")]
    Capacity(String),

    /// Per-function invocation rate exhausted
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Per-function invocation queue is full
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// Requested function has no registered scheduler
    #[error("Function handler not found: {0}")]
    HandlerNotFound(String),

    /// Workflow exceeded its time budget
    #[error("Workflow timeout: {0}")]
    WorkflowTimeout(String),

    /// Workflow state type has no executor
    #[error("Unsupported state type: {0}")]
    StateUnsupported(String),

    /// Workflow task process failed
    #[error("Task error: {0}")]
    Task(String),

    /// HTTP request or response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GatewayError {
    /// Map an error to the HTTP status returned to the client.
    ///
    /// Malformed specs surface as 404 (the function cannot be resolved),
    /// rate exhaustion as 408, queue overflow as 403, scale failures as 500,
    /// and orchestrator transport failures as 502.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Spec(_) | Self::Resource(_) => StatusCode::NOT_FOUND,
            Self::RateLimited(_) => StatusCode::REQUEST_TIMEOUT,
            Self::QueueFull(_) => StatusCode::FORBIDDEN,
            Self::Capacity(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::WorkflowTimeout(_) | Self::Task(_) => StatusCode::BAD_REQUEST,
            Self::StateUnsupported(_) => StatusCode::NOT_IMPLEMENTED,
            Self::Upstream(_) | Self::Http(_) => StatusCode::BAD_GATEWAY,
            Self::HandlerNotFound(_) => StatusCode::NOT_FOUND,
            Self::Config(_) | Self::Io(_) | Self::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, GatewayError>;
