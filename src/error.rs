use thiserror::Error;

use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task already exists: {0}")]
    DuplicateTask(TaskId),

    #[error("Task {0} is not ready: dependencies unsatisfied")]
    TaskNotReady(TaskId),

    #[error("Task {id} failed: {error}")]
    TaskExecutionFailed { id: TaskId, error: String },

    #[error("Task {0} was cancelled")]
    TaskCancelled(TaskId),

    #[error("Task {id} starved waiting on dependency {dependency}")]
    DependencyStarved { id: TaskId, dependency: TaskId },

    #[error("Adding {id} would create a dependency cycle")]
    DependencyCycle { id: TaskId },

    #[error(
        "Operation timed out after {after:?}{}",
        .last_error.as_deref().map(|e| format!(" (last error: {})", e)).unwrap_or_default()
    )]
    TimeoutExceeded {
        after: std::time::Duration,
        last_error: Option<String>,
    },

    #[error("Scheduler at capacity (max: {max})")]
    AtCapacity { max: usize },

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Crew not found: {0}")]
    CrewNotFound(String),

    #[error("No healthy alternative for agent {agent}")]
    NoHealthyAlternative { agent: String },

    #[error("Unknown conflict type: {0}")]
    UnknownConflictType(String),

    #[error("Invalid conflict: {0}")]
    InvalidConflict(String),

    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;
