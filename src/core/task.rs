//! Task data model for the scheduler.
//!
//! Tasks are the atomic units of work handed to an executor. Each task
//! carries its priority, typed dependency edges, retry policy, status
//! and execution metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use uuid::Uuid;

/// Default number of retries after the first failed attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default per-attempt timeout.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// Unique identifier for a task.
///
/// Callers may supply their own identifiers; otherwise a UUID v4 is
/// generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Return at most the first 8 characters for display.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

/// Task priority. Lower ordinal means higher priority, so the derived
/// ordering sorts `Critical` first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical = 1,
    High = 2,
    #[default]
    Medium = 3,
    Low = 4,
    Background = 5,
}

impl TaskPriority {
    pub const ALL: [TaskPriority; 5] = [
        TaskPriority::Critical,
        TaskPriority::High,
        TaskPriority::Medium,
        TaskPriority::Low,
        TaskPriority::Background,
    ];

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.ordinal() == ordinal)
    }

    /// Map a real-valued priority (e.g. an averaged one) onto the nearest band,
    /// clamped to the valid range.
    pub fn nearest(value: f64) -> Self {
        let rounded = value.round().clamp(1.0, 5.0) as u8;
        Self::from_ordinal(rounded).unwrap_or_default()
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskPriority::Critical => "critical",
            TaskPriority::High => "high",
            TaskPriority::Medium => "medium",
            TaskPriority::Low => "low",
            TaskPriority::Background => "background",
        };
        write!(f, "{}", s)
    }
}

/// Task status in its lifecycle.
///
/// `Pending -> Ready -> Running -> {Completed | Failed | Cancelled}`.
/// `Blocked` is assigned when execution is attempted before the task's
/// dependencies hold; it is re-evaluated like `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
    Blocked,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Blocked => "blocked",
        };
        write!(f, "{}", s)
    }
}

/// Condition a predecessor must meet before a dependent task may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    /// Predecessor reached `Completed`.
    #[default]
    Completion,
    /// Predecessor reached `Completed` without recording any error.
    Success,
    /// Predecessor reached `Completed`; its result is passed as input.
    Data,
}

impl std::fmt::Display for DependencyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DependencyType::Completion => "completion",
            DependencyType::Success => "success",
            DependencyType::Data => "data",
        };
        write!(f, "{}", s)
    }
}

/// A typed edge from a task to one of its predecessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub task_id: TaskId,
    #[serde(default)]
    pub kind: DependencyType,
}

impl Dependency {
    pub fn new(task_id: impl Into<TaskId>, kind: DependencyType) -> Self {
        Self {
            task_id: task_id.into(),
            kind,
        }
    }

    /// Whether `predecessor` satisfies this edge's condition.
    pub fn is_satisfied_by(&self, predecessor: &Task) -> bool {
        if predecessor.status != TaskStatus::Completed {
            return false;
        }
        match self.kind {
            DependencyType::Completion | DependencyType::Data => true,
            DependencyType::Success => predecessor.error_count == 0,
        }
    }

    /// Whether `predecessor` is terminal and can never satisfy this edge
    /// without being resubmitted.
    pub fn is_unsatisfiable_by(&self, predecessor: &Task) -> bool {
        match predecessor.status {
            TaskStatus::Failed | TaskStatus::Cancelled => true,
            TaskStatus::Completed => !self.is_satisfied_by(predecessor),
            _ => false,
        }
    }
}

/// A single unit of schedulable work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    /// Opaque description of what the executor should produce.
    pub expected_output: String,
    pub priority: TaskPriority,
    /// Predecessor edges in declaration order.
    pub dependencies: Vec<Dependency>,
    /// Tasks that declared this one as a predecessor.
    pub dependents: BTreeSet<TaskId>,
    pub max_retries: u32,
    /// Per-attempt timeout.
    pub timeout: Duration,
    pub metadata: HashMap<String, Value>,
    pub status: TaskStatus,
    /// Executor output; set if and only if `status` is `Completed`.
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_time: Option<Duration>,
    pub retry_count: u32,
    pub error_count: u32,
    pub last_error: Option<String>,
}

impl Task {
    /// Create a pending task with a generated id and default policy.
    pub fn new(description: &str) -> Self {
        Self {
            id: TaskId::new(),
            description: description.to_string(),
            expected_output: String::new(),
            priority: TaskPriority::default(),
            dependencies: Vec::new(),
            dependents: BTreeSet::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: DEFAULT_TASK_TIMEOUT,
            metadata: HashMap::new(),
            status: TaskStatus::Pending,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            execution_time: None,
            retry_count: 0,
            error_count: 0,
            last_error: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_expected_output(mut self, expected: &str) -> Self {
        self.expected_output = expected.to_string();
        self
    }

    pub fn with_dependency(mut self, task_id: impl Into<TaskId>, kind: DependencyType) -> Self {
        self.dependencies.push(Dependency::new(task_id, kind));
        self
    }

    /// Shorthand for a `Completion` dependency.
    pub fn depends_on(self, task_id: impl Into<TaskId>) -> Self {
        self.with_dependency(task_id, DependencyType::Completion)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Mark the task as ready for dispatch.
    pub fn mark_ready(&mut self) {
        self.status = TaskStatus::Ready;
    }

    /// Transition to Running and record the start time.
    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Record the result and transition to Completed.
    pub fn complete(&mut self, result: Value) {
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.finish();
    }

    /// Transition to Failed. The error is recorded as the last error.
    pub fn fail(&mut self, error: &str) {
        self.status = TaskStatus::Failed;
        self.result = None;
        self.last_error = Some(error.to_string());
        self.finish();
    }

    pub fn cancel(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.result = None;
        self.completed_at = Some(Utc::now());
    }

    pub fn block(&mut self, reason: &str) {
        self.status = TaskStatus::Blocked;
        self.last_error = Some(reason.to_string());
    }

    /// Record a failed attempt without changing status.
    pub fn record_error(&mut self, error: &str) {
        self.error_count += 1;
        self.last_error = Some(error.to_string());
    }

    /// Reset a terminal task so it can be scheduled again. History
    /// counters are kept.
    pub fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.result = None;
        self.started_at = None;
        self.completed_at = None;
        self.execution_time = None;
    }

    fn finish(&mut self) {
        let now = Utc::now();
        self.completed_at = Some(now);
        if let Some(started) = self.started_at {
            self.execution_time = (now - started).to_std().ok();
        }
    }

    /// Check if the task is in a terminal state.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if the task is waiting to be dispatched.
    pub fn is_waiting(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Blocked
        )
    }

    /// Evaluate readiness against a predecessor lookup.
    ///
    /// A missing predecessor counts as not ready, never as an error.
    pub fn is_ready_with<'a, F>(&self, lookup: F) -> bool
    where
        F: Fn(&TaskId) -> Option<&'a Task>,
    {
        if !matches!(self.status, TaskStatus::Pending | TaskStatus::Blocked) {
            return false;
        }
        self.dependencies.iter().all(|dep| {
            lookup(&dep.task_id)
                .map(|pred| dep.is_satisfied_by(pred))
                .unwrap_or(false)
        })
    }
}
