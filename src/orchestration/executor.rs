//! The unit of work behind a task.
//!
//! The scheduler knows nothing about what a task does; it hands a
//! [`TaskInput`] to an [`Executor`] once per attempt and records whatever
//! comes back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::process::Stdio;
use tokio::process::Command;

use crate::core::task::{Task, TaskId};
use crate::log_debug;

/// Metadata key holding the shell command run by [`CommandExecutor`].
pub const COMMAND_METADATA_KEY: &str = "command";

/// Everything an executor sees for a single attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInput {
    pub task_id: TaskId,
    pub description: String,
    pub expected_output: String,
    pub metadata: HashMap<String, Value>,
    /// Results of `data` predecessors keyed by predecessor id.
    pub context: BTreeMap<String, Value>,
    /// Zero-based attempt number.
    pub attempt: u32,
}

impl TaskInput {
    pub fn from_task(task: &Task, context: BTreeMap<String, Value>) -> Self {
        Self {
            task_id: task.id.clone(),
            description: task.description.clone(),
            expected_output: task.expected_output.clone(),
            metadata: task.metadata.clone(),
            context,
            attempt: 0,
        }
    }
}

/// Failure reported by an executor for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ExecutionError(pub String);

impl From<&str> for ExecutionError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ExecutionError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Performs the work of a task.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, input: TaskInput) -> std::result::Result<Value, ExecutionError>;
}

/// Adapts an async closure into an [`Executor`].
///
/// ```ignore
/// let exec = FnExecutor::new(|input: TaskInput| async move {
///     Ok(serde_json::json!(input.description.len()))
/// });
/// ```
pub struct FnExecutor<F> {
    f: F,
}

impl<F> FnExecutor<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Executor for FnExecutor<F>
where
    F: Fn(TaskInput) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Value, ExecutionError>> + Send,
{
    async fn execute(&self, input: TaskInput) -> std::result::Result<Value, ExecutionError> {
        (self.f)(input).await
    }
}

/// Runs the task's `command` metadata entry through `sh -c`.
///
/// The task id, attempt number and data context are exported as
/// `CREWLINE_TASK_ID`, `CREWLINE_ATTEMPT` and `CREWLINE_CONTEXT` (JSON).
/// Standard output becomes the result: parsed as JSON when possible,
/// otherwise kept as a trimmed string. A non-zero exit is a failure
/// carrying standard error.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    shell: Option<String>,
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(shell: &str) -> Self {
        Self {
            shell: Some(shell.to_string()),
        }
    }

    fn shell(&self) -> &str {
        self.shell.as_deref().unwrap_or("sh")
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(&self, input: TaskInput) -> std::result::Result<Value, ExecutionError> {
        let command = input
            .metadata
            .get(COMMAND_METADATA_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ExecutionError(format!("task {} has no command", input.task_id))
            })?;

        let context = serde_json::to_string(&input.context)
            .map_err(|e| ExecutionError(format!("context encoding failed: {}", e)))?;

        log_debug!(
            "CommandExecutor: task={} attempt={} cmd={}",
            input.task_id,
            input.attempt,
            command
        );

        // kill_on_drop: a per-attempt timeout drops this future and must not
        // leave the child running.
        let output = Command::new(self.shell())
            .arg("-c")
            .arg(command)
            .env("CREWLINE_TASK_ID", input.task_id.as_str())
            .env("CREWLINE_ATTEMPT", input.attempt.to_string())
            .env("CREWLINE_CONTEXT", context)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ExecutionError(format!("failed to spawn: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(ExecutionError(if stderr.is_empty() {
                format!("command exited with {}", code)
            } else {
                format!("command exited with {}: {}", code, stderr)
            }));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(serde_json::from_str(&stdout).unwrap_or(Value::String(stdout)))
    }
}
