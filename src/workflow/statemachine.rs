//! State machine types and the execution engine
//!
//! Only Task states execute today; the schema reserves the shape of the
//! remaining state types for future work. Task states fork an external
//! process, stream the pipeline input into its stdin, and read stdout as
//! the pipeline output. A task that outlives its budget is killed.

use bytes::Bytes;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::WatchdogConfig;
use crate::error::{GatewayError, Result};

/// State type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateType {
    /// Execute an external process
    Task,
    /// Pass input through (reserved)
    Pass,
    /// Branch on input (reserved)
    Choice,
    /// Delay (reserved)
    Wait,
    /// Terminate with an error (reserved)
    Fail,
    /// Terminate successfully (reserved)
    Succeed,
    /// Parallel branches (reserved)
    Parallel,
    /// Iterate over items (reserved)
    Map,
}

/// A single state in the workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct State {
    /// State type; only Task executes
    #[serde(rename = "Type")]
    pub state_type: StateType,

    /// Name of the state to transition to
    #[serde(default)]
    pub next: Option<String>,

    /// Whether this state terminates the workflow
    #[serde(default)]
    pub end: bool,

    /// Free-form description
    #[serde(default)]
    pub comment: String,

    /// Task identifier resolved through the process map
    #[serde(default)]
    pub resource: String,

    /// Per-state execution budget in seconds; 0 inherits the remaining
    /// workflow budget
    #[serde(default)]
    pub timeout_seconds: f64,

    /// Pass-state output (reserved)
    #[serde(default)]
    pub result: Option<String>,

    /// Wait-state delay (reserved)
    #[serde(default)]
    pub seconds: Option<u64>,

    /// Fail-state cause (reserved)
    #[serde(default)]
    pub cause: Option<String>,

    /// Fail-state error name (reserved)
    #[serde(default)]
    pub error: Option<String>,
}

/// The declared execution flow of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StateMachine {
    /// Free-form description
    #[serde(default)]
    pub comment: String,

    /// Name of the initial state
    pub start_at: String,

    /// Workflow execution budget in seconds; 0 defers to the watchdog
    /// configuration
    #[serde(default)]
    pub timeout_seconds: f64,

    /// Schema version
    #[serde(default)]
    pub version: String,

    /// All states by name
    #[serde(default)]
    pub states: HashMap<String, State>,
}

impl StateMachine {
    /// Parse a state-machine document from JSON
    pub fn parse(document: &[u8]) -> Result<Self> {
        serde_json::from_slice(document)
            .map_err(|e| GatewayError::Config(format!("Invalid state machine: {}", e)))
    }
}

/// Execute the workflow over `input`, returning the final pipeline output.
///
/// States run sequentially from `start_at`. Before each state the remaining
/// workflow budget is checked; once it is spent the workflow terminates
/// with a timeout. A `Next` naming no known state ends the chain with the
/// current output.
pub async fn execute(config: &WatchdogConfig, input: Bytes) -> Result<Bytes> {
    let start = Instant::now();
    tracing::info!(workflow = %config.name, "starting workflow");

    let budget = if config.workflow.timeout_seconds > 0.0 {
        Duration::from_secs_f64(config.workflow.timeout_seconds)
    } else {
        config.exec_timeout
    };

    let mut pipe = input.to_vec();
    let mut current = config.workflow.states.get(&config.workflow.start_at);

    while let Some(state) = current {
        let time_left = budget.as_secs_f64() - start.elapsed().as_secs_f64();
        if time_left <= 0.0 {
            return Err(GatewayError::WorkflowTimeout(
                "Timeout, workflow is terminated".into(),
            ));
        }

        match state.state_type {
            StateType::Task => {
                pipe = run_task(config, state, time_left, &pipe).await?;
            }
            other => {
                return Err(GatewayError::StateUnsupported(format!("{:?}", other)));
            }
        }

        if state.end {
            break;
        }
        current = state
            .next
            .as_ref()
            .and_then(|next| config.workflow.states.get(next));
    }

    tracing::info!(
        workflow = %config.name,
        duration_ms = start.elapsed().as_millis() as u64,
        "workflow finished"
    );
    Ok(Bytes::from(pipe))
}

/// Execute the workflow and map the outcome onto an HTTP response surface
pub async fn handle_request(config: &WatchdogConfig, input: Bytes) -> (StatusCode, Bytes) {
    match execute(config, input).await {
        Ok(output) => (StatusCode::OK, output),
        Err(e) => {
            tracing::error!(workflow = %config.name, error = %e, "workflow failed");
            (e.status_code(), Bytes::from(e.to_string()))
        }
    }
}

/// Fork the task process, stream input through it, and collect its output
async fn run_task(
    config: &WatchdogConfig,
    state: &State,
    time_left: f64,
    input: &[u8],
) -> Result<Vec<u8>> {
    let task_info = format!("doTask {}", state.resource);
    let start = Instant::now();

    let process = config.processes.get(&state.resource).ok_or_else(|| {
        GatewayError::Task(format!("{}: function not found", task_info))
    })?;
    let mut parts = process.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| GatewayError::Task(format!("{}: empty command", task_info)))?;

    tracing::info!(resource = %state.resource, process = %process, "forking new process");

    let mut child = tokio::process::Command::new(program)
        .args(parts)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| GatewayError::Task(format!("{}: spawn failed: {}", task_info, e)))?;

    // Feed stdin from a separate task so a full pipe cannot deadlock the
    // child against its unread output.
    let stdin = child.stdin.take();
    let pipe_in = input.to_vec();
    let writer = tokio::spawn(async move {
        if let Some(mut stdin) = stdin {
            let _ = stdin.write_all(&pipe_in).await;
        }
    });

    let stdout = child.stdout.take();
    let stdout_reader = tokio::spawn(async move {
        let mut out = Vec::new();
        if let Some(mut stdout) = stdout {
            let _ = stdout.read_to_end(&mut out).await;
        }
        out
    });
    let stderr = child.stderr.take();
    let stderr_reader = tokio::spawn(async move {
        let mut out = Vec::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_end(&mut out).await;
        }
        out
    });

    let task_budget = if state.timeout_seconds > 0.0 {
        time_left.min(state.timeout_seconds)
    } else {
        time_left
    };

    let status = match tokio::time::timeout(Duration::from_secs_f64(task_budget), child.wait()).await
    {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            return Err(GatewayError::Task(format!(
                "{}: process error: {}",
                task_info, e
            )));
        }
        Err(_) => {
            tracing::warn!(resource = %state.resource, "terminating task");
            let _ = child.kill().await;
            return Err(GatewayError::WorkflowTimeout("Timeout, killed".into()));
        }
    };

    let _ = writer.await;
    let mut out = stdout_reader.await.unwrap_or_default();
    let err_out = stderr_reader.await.unwrap_or_default();

    if config.combine_output {
        out.extend_from_slice(&err_out);
    } else if !err_out.is_empty() {
        tracing::warn!(resource = %state.resource, stderr = %String::from_utf8_lossy(&err_out), "task stderr");
    }

    if config.write_debug {
        tracing::debug!(
            resource = %state.resource,
            success = status.success(),
            out = %String::from_utf8_lossy(&out),
            "task output"
        );
    }

    if !status.success() {
        return Err(GatewayError::Task(format!(
            "{}: exit status {}",
            task_info,
            status.code().unwrap_or(-1)
        )));
    }

    tracing::info!(
        resource = %state.resource,
        bytes = out.len(),
        duration_ms = start.elapsed().as_millis() as u64,
        "task finished"
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(resource: &str, next: Option<&str>, end: bool) -> State {
        State {
            state_type: StateType::Task,
            next: next.map(|s| s.to_string()),
            end,
            comment: String::new(),
            resource: resource.into(),
            timeout_seconds: 0.0,
            result: None,
            seconds: None,
            cause: None,
            error: None,
        }
    }

    fn config(
        states: Vec<(&str, State)>,
        start_at: &str,
        workflow_timeout: f64,
        processes: Vec<(&str, &str)>,
    ) -> WatchdogConfig {
        WatchdogConfig {
            name: "test".into(),
            workflow: StateMachine {
                comment: String::new(),
                start_at: start_at.into(),
                timeout_seconds: workflow_timeout,
                version: String::new(),
                states: states
                    .into_iter()
                    .map(|(name, state)| (name.to_string(), state))
                    .collect(),
            },
            processes: processes
                .into_iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
            exec_timeout: Duration::from_secs(10),
            combine_output: false,
            write_debug: false,
        }
    }

    // --- Parsing ---

    #[test]
    fn test_parse_state_machine() {
        let doc = br#"{
            "Comment": "two-step pipeline",
            "StartAt": "lower",
            "TimeoutSeconds": 5,
            "States": {
                "lower": {"Type": "Task", "Resource": "lower", "Next": "strip"},
                "strip": {"Type": "Task", "Resource": "strip", "End": true, "TimeoutSeconds": 2}
            }
        }"#;
        let machine = StateMachine::parse(doc).unwrap();
        assert_eq!(machine.start_at, "lower");
        assert_eq!(machine.timeout_seconds, 5.0);
        assert_eq!(machine.states.len(), 2);
        assert_eq!(machine.states["lower"].next.as_deref(), Some("strip"));
        assert!(machine.states["strip"].end);
        assert_eq!(machine.states["strip"].timeout_seconds, 2.0);
    }

    #[test]
    fn test_parse_reserved_state_types() {
        let doc = br#"{
            "StartAt": "choose",
            "States": {
                "choose": {"Type": "Choice"},
                "hold": {"Type": "Wait", "Seconds": 3},
                "stop": {"Type": "Fail", "Cause": "bad input", "Error": "BadInput"}
            }
        }"#;
        let machine = StateMachine::parse(doc).unwrap();
        assert_eq!(machine.states["choose"].state_type, StateType::Choice);
        assert_eq!(machine.states["hold"].seconds, Some(3));
        assert_eq!(machine.states["stop"].cause.as_deref(), Some("bad input"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(StateMachine::parse(b"not json").is_err());
        assert!(StateMachine::parse(b"{}").is_err());
    }

    // --- Execution ---

    #[tokio::test]
    async fn test_single_task_pipes_through() {
        let config = config(
            vec![("copy", task("copy", None, true))],
            "copy",
            5.0,
            vec![("copy", "cat")],
        );
        let out = execute(&config, Bytes::from("hello")).await.unwrap();
        assert_eq!(out, Bytes::from("hello"));
    }

    #[tokio::test]
    async fn test_two_task_sequence() {
        // Lowercase, then drop commas.
        let config = config(
            vec![
                ("lower", task("lower", Some("strip"), false)),
                ("strip", task("strip", None, true)),
            ],
            "lower",
            5.0,
            vec![
                ("lower", "tr [:upper:] [:lower:]"),
                ("strip", "tr -d ,"),
            ],
        );
        let out = execute(&config, Bytes::from("TeSt, DatA")).await.unwrap();
        assert_eq!(out, Bytes::from("test data"));
    }

    #[tokio::test]
    async fn test_workflow_timeout_kills_task() {
        let config = config(
            vec![
                ("first", task("first", Some("second"), false)),
                ("second", task("second", None, true)),
            ],
            "first",
            1.0,
            vec![("first", "sleep 2"), ("second", "sleep 2")],
        );
        let err = execute(&config, Bytes::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::WorkflowTimeout(_)));
        assert!(err.to_string().contains("Timeout"));
    }

    #[tokio::test]
    async fn test_per_state_timeout_kills_task() {
        let mut state = task("slow", None, true);
        state.timeout_seconds = 0.2;
        let config = config(
            vec![("slow", state)],
            "slow",
            10.0,
            vec![("slow", "sleep 5")],
        );
        let started = Instant::now();
        let err = execute(&config, Bytes::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::WorkflowTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_unsupported_state_type() {
        let mut state = task("x", None, true);
        state.state_type = StateType::Choice;
        let config = config(vec![("choose", state)], "choose", 5.0, vec![]);
        let err = execute(&config, Bytes::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::StateUnsupported(_)));
    }

    #[tokio::test]
    async fn test_unknown_resource_fails() {
        let config = config(
            vec![("ghost", task("ghost", None, true))],
            "ghost",
            5.0,
            vec![],
        );
        let err = execute(&config, Bytes::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Task(_)));
        assert!(err.to_string().contains("function not found"));
    }

    #[tokio::test]
    async fn test_failing_task_surfaces_exit_status() {
        let config = config(
            vec![("boom", task("boom", None, true))],
            "boom",
            5.0,
            vec![("boom", "false")],
        );
        let err = execute(&config, Bytes::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Task(_)));
        assert!(err.to_string().contains("exit status"));
    }

    #[tokio::test]
    async fn test_unknown_next_ends_chain() {
        let config = config(
            vec![("copy", task("copy", Some("missing"), false))],
            "copy",
            5.0,
            vec![("copy", "cat")],
        );
        let out = execute(&config, Bytes::from("tail")).await.unwrap();
        assert_eq!(out, Bytes::from("tail"));
    }

    #[tokio::test]
    async fn test_unknown_start_state_yields_input() {
        let config = config(vec![], "missing", 5.0, vec![]);
        let out = execute(&config, Bytes::from("untouched")).await.unwrap();
        assert_eq!(out, Bytes::from("untouched"));
    }

    // --- HTTP surface ---

    #[tokio::test]
    async fn test_handle_request_success() {
        let config = config(
            vec![("copy", task("copy", None, true))],
            "copy",
            5.0,
            vec![("copy", "cat")],
        );
        let (status, body) = handle_request(&config, Bytes::from("ok")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from("ok"));
    }

    #[tokio::test]
    async fn test_handle_request_timeout_is_400_with_timeout_body() {
        let config = config(
            vec![("slow", task("slow", None, true))],
            "slow",
            1.0,
            vec![("slow", "sleep 2")],
        );
        let (status, body) = handle_request(&config, Bytes::new()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(String::from_utf8_lossy(&body).contains("Timeout"));
    }

    #[tokio::test]
    async fn test_handle_request_unsupported_is_501() {
        let mut state = task("x", None, true);
        state.state_type = StateType::Parallel;
        let config = config(vec![("par", state)], "par", 5.0, vec![]);
        let (status, _) = handle_request(&config, Bytes::new()).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    }
}
