//! End-to-end workflow runs: TOML files on disk, shell commands as tasks.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use crewline::core::TaskStatus;
use crewline::orchestration::{CommandExecutor, SchedulerConfig, TaskScheduler};
use crewline::workflow::{self, TaskReport, WorkflowFile, WorkflowSummary};

/// Write `content` as a workflow file in a fresh temp dir and load it.
fn load(content: &str) -> (TempDir, WorkflowFile) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("workflow.toml");
    fs::write(&path, content).unwrap();
    let wf = WorkflowFile::load(&path).unwrap();
    (dir, wf)
}

fn command_scheduler() -> TaskScheduler {
    TaskScheduler::new(
        Arc::new(CommandExecutor::new()),
        SchedulerConfig::default()
            .with_max_concurrent(2)
            .with_tick_interval(Duration::from_millis(20))
            .with_backoff(Duration::from_millis(10), Duration::from_millis(50)),
    )
}

fn report<'a>(summary: &'a WorkflowSummary, id: &str) -> &'a TaskReport {
    summary.tasks.iter().find(|t| t.id == id).unwrap()
}

/// Given a three-step workflow with a data dependency
/// When it runs through shell commands
/// Then every step completes and the dependent step sees its input as JSON
#[tokio::test]
async fn test_workflow_passes_data_between_steps() {
    let (_dir, wf) = load(
        r#"
        name = "counter"

        [[tasks]]
        id = "count"
        command = "echo 41"

        [[tasks]]
        id = "echo_context"
        command = "echo \"$CREWLINE_CONTEXT\""
        depends_on = ["count"]
        dependency = "data"

        [[tasks]]
        id = "report"
        command = "printf done"
        depends_on = ["echo_context"]
        "#,
    );

    let sched = command_scheduler();
    let summary = workflow::run(&sched, &wf, Duration::from_secs(30))
        .await
        .unwrap();

    assert!(summary.succeeded(), "{summary:#?}");
    assert_eq!(summary.name.as_deref(), Some("counter"));
    assert_eq!(summary.counts.get("completed"), Some(&3));
    assert_eq!(report(&summary, "count").result, Some(json!(41)));
    assert_eq!(
        report(&summary, "echo_context").result,
        Some(json!({ "count": 41 }))
    );
    assert_eq!(report(&summary, "report").result, Some(json!("done")));
    assert!(!sched.is_running());
}

/// Given a workflow whose first step exits non-zero
/// When it runs without retries
/// Then the step fails with its stderr and the dependent step is cancelled
#[tokio::test]
async fn test_failed_step_cancels_dependents() {
    let (_dir, wf) = load(
        r#"
        [[tasks]]
        id = "setup"
        command = "echo boom >&2; exit 3"
        max_retries = 0

        [[tasks]]
        id = "deploy"
        command = "echo deployed"
        depends_on = ["setup"]
        "#,
    );

    let sched = command_scheduler();
    let summary = workflow::run(&sched, &wf, Duration::from_secs(30))
        .await
        .unwrap();

    assert!(!summary.succeeded());
    assert!(!summary.timed_out);

    let setup = report(&summary, "setup");
    assert_eq!(setup.status, TaskStatus::Failed);
    assert_eq!(setup.error.as_deref(), Some("command exited with 3: boom"));
    assert_eq!(setup.attempts, 1);

    assert_eq!(report(&summary, "deploy").status, TaskStatus::Cancelled);
    assert_eq!(summary.counts.get("failed"), Some(&1));
    assert_eq!(summary.counts.get("cancelled"), Some(&1));
}

/// Given a step that only succeeds on its second attempt
/// When it runs with one retry
/// Then it completes and reports two attempts
#[tokio::test]
async fn test_step_retries_until_success() {
    let (_dir, wf) = load(
        r#"
        [[tasks]]
        id = "flaky"
        command = "test \"$CREWLINE_ATTEMPT\" -ge 1 && echo ok"
        max_retries = 1
        "#,
    );

    let sched = command_scheduler();
    let summary = workflow::run(&sched, &wf, Duration::from_secs(30))
        .await
        .unwrap();

    assert!(summary.succeeded());
    let flaky = report(&summary, "flaky");
    assert_eq!(flaky.attempts, 2);
    assert_eq!(flaky.result, Some(json!("ok")));
}

/// Given a step slower than the overall run timeout
/// When the run gives up
/// Then the summary is marked timed out and the step hits its own timeout
#[tokio::test]
async fn test_run_timeout_marks_summary() {
    let (_dir, wf) = load(
        r#"
        [[tasks]]
        id = "slow"
        command = "sleep 5"
        max_retries = 0
        timeout_secs = 1
        "#,
    );

    let sched = command_scheduler();
    let summary = workflow::run(&sched, &wf, Duration::from_millis(200))
        .await
        .unwrap();

    assert!(summary.timed_out);
    assert!(!summary.succeeded());
    let slow = report(&summary, "slow");
    assert_eq!(slow.status, TaskStatus::Failed);
    assert!(slow.error.as_deref().unwrap().contains("timed out"));
}
