//! Workflow execution — a declared state machine of function tasks
//!
//! The companion watchdog accepts a state-machine document (Task-type
//! states chained by `Next`/`End`), resolves each task's `Resource` to a
//! command line, and pipes the request body through the chain under a
//! per-state and per-workflow time budget.

pub mod statemachine;

pub use statemachine::{execute, handle_request, State, StateMachine, StateType};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{GatewayError, Result};

/// Runtime configuration of the workflow executor
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Workflow name visible in logs
    pub name: String,
    /// The state machine to execute
    pub workflow: StateMachine,
    /// Resource identifier → command line
    pub processes: HashMap<String, String>,
    /// Overall execution budget when the workflow declares none
    pub exec_timeout: Duration,
    /// Combine stderr into the response output
    pub combine_output: bool,
    /// Log process output
    pub write_debug: bool,
}

/// On-disk form of the watchdog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogFileConfig {
    /// Workflow name
    #[serde(default = "default_name")]
    pub name: String,
    /// State-machine document
    pub workflow: StateMachine,
    /// Resource identifier → command line
    #[serde(default)]
    pub processes: HashMap<String, String>,
    /// Overall execution budget in seconds
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout_secs: f64,
    /// Combine stderr into the response output
    #[serde(default)]
    pub combine_output: bool,
    /// Log process output
    #[serde(default)]
    pub write_debug: bool,
}

fn default_name() -> String {
    "workflow".to_string()
}

fn default_exec_timeout() -> f64 {
    10.0
}

impl WatchdogConfig {
    /// Load the watchdog configuration from a JSON file
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let file: WatchdogFileConfig = serde_json::from_str(&content)
            .map_err(|e| GatewayError::Config(format!("Invalid watchdog config: {}", e)))?;
        Ok(file.into())
    }
}

impl From<WatchdogFileConfig> for WatchdogConfig {
    fn from(file: WatchdogFileConfig) -> Self {
        Self {
            name: file.name,
            workflow: file.workflow,
            processes: file.processes,
            exec_timeout: Duration::from_secs_f64(file.exec_timeout_secs),
            combine_output: file.combine_output,
            write_debug: file.write_debug,
        }
    }
}
