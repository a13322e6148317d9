//! Workflow files: a task graph of shell commands described in TOML.
//!
//! ```toml
//! name = "release"
//!
//! [[tasks]]
//! id = "build"
//! command = "cargo build --release"
//! priority = "high"
//!
//! [[tasks]]
//! id = "package"
//! command = "tar czf out.tgz target/release/app"
//! depends_on = ["build"]
//! dependency = "success"
//! max_retries = 1
//! timeout_secs = 120
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::core::task::{DependencyType, Task, TaskId, TaskPriority, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::{SchedulerConfig, TaskScheduler, COMMAND_METADATA_KEY};
use crate::{log_debug, log_info, log_warn};

/// How often `run` re-checks for progress.
const PROGRESS_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowFile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tasks: Vec<TaskDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDef {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    pub command: String,
    #[serde(default)]
    pub expected_output: Option<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Edge type for every entry of `depends_on`.
    #[serde(default)]
    pub dependency: DependencyType,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl WorkflowFile {
    pub fn load(path: &Path) -> Result<Self> {
        log_debug!("WorkflowFile::load path={}", path.display());
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let workflow: Self = toml::from_str(content)?;
        workflow.validate()?;
        Ok(workflow)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(Error::Validation("workflow has no tasks".to_string()));
        }
        let mut seen = HashSet::new();
        for def in &self.tasks {
            if def.id.trim().is_empty() {
                return Err(Error::Validation("task id must not be empty".to_string()));
            }
            if !seen.insert(def.id.as_str()) {
                return Err(Error::DuplicateTask(TaskId::from(def.id.as_str())));
            }
            if def.command.trim().is_empty() {
                return Err(Error::Validation(format!("task {} has no command", def.id)));
            }
        }
        for def in &self.tasks {
            if let Some(missing) = def.depends_on.iter().find(|d| !seen.contains(d.as_str())) {
                return Err(Error::Validation(format!(
                    "task {} depends on unknown task {}",
                    def.id, missing
                )));
            }
        }
        Ok(())
    }

    /// Build tasks, filling retries and timeout from `defaults`.
    pub fn to_tasks(&self, defaults: &SchedulerConfig) -> Vec<Task> {
        self.tasks
            .iter()
            .map(|def| {
                let mut task = Task::new(def.description.as_deref().unwrap_or(&def.command))
                    .with_id(def.id.as_str())
                    .with_priority(def.priority)
                    .with_max_retries(def.max_retries.unwrap_or(defaults.default_max_retries))
                    .with_timeout(
                        def.timeout_secs
                            .map(Duration::from_secs)
                            .unwrap_or(defaults.default_timeout),
                    )
                    .with_metadata(COMMAND_METADATA_KEY, Value::String(def.command.clone()));
                if let Some(expected) = &def.expected_output {
                    task = task.with_expected_output(expected);
                }
                for dep in &def.depends_on {
                    task = task.with_dependency(dep.as_str(), def.dependency);
                }
                task
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    pub id: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub result: Option<Value>,
    pub execution_secs: Option<f64>,
}

/// Outcome of a workflow run, printed as JSON by the CLI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowSummary {
    pub name: Option<String>,
    pub tasks: Vec<TaskReport>,
    pub counts: BTreeMap<String, usize>,
    pub timed_out: bool,
    pub elapsed_secs: f64,
}

impl WorkflowSummary {
    pub fn succeeded(&self) -> bool {
        !self.timed_out
            && self
                .tasks
                .iter()
                .all(|t| t.status == TaskStatus::Completed)
    }
}

/// Submit every task, run the scheduler until nothing more can progress or
/// `timeout` passes, then stop it and report.
///
/// Tasks left waiting on a failed or cancelled dependency once nothing is
/// running are cancelled rather than waited on.
pub async fn run(
    scheduler: &TaskScheduler,
    workflow: &WorkflowFile,
    timeout: Duration,
) -> Result<WorkflowSummary> {
    let started = Instant::now();
    for task in workflow.to_tasks(scheduler.config()) {
        scheduler.submit(task).await?;
    }
    log_info!(
        "Workflow {}: {} tasks submitted",
        workflow.name.as_deref().unwrap_or("(unnamed)"),
        workflow.tasks.len()
    );

    scheduler.start()?;
    let deadline = started + timeout;
    let mut timed_out = false;
    loop {
        let wait = PROGRESS_POLL.min(deadline.saturating_duration_since(Instant::now()));
        match scheduler.wait_for_all(wait).await {
            Ok(_) => break,
            Err(Error::TimeoutExceeded { .. }) => {}
            Err(e) => {
                scheduler.stop().await;
                return Err(e);
            }
        }

        let stats = scheduler.stats().await;
        let starved = scheduler.starved_tasks().await;
        if stats.in_flight == 0 && stats.queued > 0 && starved.len() == stats.queued {
            for (id, dependency) in &starved {
                log_warn!("Workflow: cancelling {} (dependency {} cannot complete)", id, dependency);
                scheduler.cancel_task(id).await?;
            }
            break;
        }
        if Instant::now() >= deadline {
            timed_out = true;
            break;
        }
    }
    scheduler.stop().await;

    let tasks: Vec<TaskReport> = scheduler
        .tasks()
        .await
        .into_iter()
        .map(|t| TaskReport {
            id: t.id.to_string(),
            status: t.status,
            attempts: t.error_count + u32::from(t.status == TaskStatus::Completed),
            error: t.last_error.clone(),
            result: t.result.clone(),
            execution_secs: t.execution_time.map(|d| d.as_secs_f64()),
        })
        .collect();
    let mut counts = BTreeMap::new();
    for t in &tasks {
        *counts.entry(t.status.to_string()).or_insert(0) += 1;
    }

    Ok(WorkflowSummary {
        name: workflow.name.clone(),
        tasks,
        counts,
        timed_out,
        elapsed_secs: started.elapsed().as_secs_f64(),
    })
}
