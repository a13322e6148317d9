//! Retry and backoff scenarios.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crewline::core::{TaskId, TaskPriority, TaskStatus};
use crewline::metrics::{self, MemorySink};
use crewline::orchestration::{SchedulerConfig, SchedulerEvent, TaskScheduler};
use crewline::Error;

use crate::fixtures::{task, RecordingExecutor, Step};

/// Given an executor that fails twice then succeeds
/// When the task allows two retries with a one second backoff base
/// Then it completes on the third attempt after at least 1s + 2s of backoff
#[tokio::test(start_paused = true)]
async fn test_retries_with_exponential_backoff() {
    let exec = Arc::new(RecordingExecutor::new());
    exec.fail_times("flaky", 2);
    let sink = Arc::new(MemorySink::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sched = TaskScheduler::builder(exec.clone())
        .config(
            SchedulerConfig::default()
                .with_tick_interval(Duration::from_millis(10))
                .with_backoff(Duration::from_secs(1), Duration::from_secs(60)),
        )
        .metrics(sink.clone())
        .events(tx)
        .build();

    let id = sched
        .submit(task("flaky", TaskPriority::High).with_max_retries(2))
        .await
        .unwrap();

    let started = Instant::now();
    sched.start().unwrap();
    let value = sched
        .wait_for_task(&id, Duration::from_secs(30))
        .await
        .unwrap();
    let elapsed = started.elapsed();
    sched.stop().await;

    assert_eq!(value["attempt"], 2);
    assert!(elapsed >= Duration::from_secs(3), "elapsed {:?}", elapsed);

    let t = sched.get_task(&id).await.unwrap();
    assert_eq!(t.status, TaskStatus::Completed);
    assert_eq!(t.retry_count, 2);
    assert_eq!(t.error_count, 2);
    assert_eq!(sink.total(metrics::TASK_RETRY), 2.0);
    assert_eq!(sink.total(metrics::TASK_COMPLETED), 1.0);

    let mut delays = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let SchedulerEvent::TaskRetrying { delay, .. } = event {
            delays.push(delay);
        }
    }
    assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(2)]);

    let starts = exec
        .log()
        .iter()
        .filter(|s| **s == Step::Start("flaky".to_string()))
        .count();
    assert_eq!(starts, 3);
}

/// Given a task that always fails
/// When its retries are exhausted
/// Then it is FAILED with every attempt counted and the last error kept
#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fail_task() {
    let exec = Arc::new(RecordingExecutor::new());
    exec.fail_times("doomed", u32::MAX);
    let sched = TaskScheduler::new(
        exec.clone(),
        SchedulerConfig::default()
            .with_tick_interval(Duration::from_millis(10))
            .with_backoff(Duration::from_millis(100), Duration::from_millis(150)),
    );
    sched
        .submit(task("doomed", TaskPriority::Medium).with_max_retries(3))
        .await
        .unwrap();

    sched.start().unwrap();
    let id = TaskId::from("doomed");
    let err = sched
        .wait_for_task(&id, Duration::from_secs(10))
        .await
        .unwrap_err();
    sched.stop().await;

    match err {
        Error::TaskExecutionFailed { error, .. } => {
            assert_eq!(error, "doomed failed on attempt 3");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    let t = sched.get_task(&id).await.unwrap();
    assert_eq!(t.status, TaskStatus::Failed);
    assert_eq!(t.error_count, 4);
    assert_eq!(t.retry_count, 3);
    assert!(t.result.is_none());
    assert_eq!(sched.stats().await.failed, 1);
}

/// Given a failed task
/// When it is resubmitted and the executor has recovered
/// Then it runs again and completes with its error history kept
#[tokio::test(start_paused = true)]
async fn test_resubmit_after_failure() {
    let exec = Arc::new(RecordingExecutor::new());
    exec.fail_times("job", 1);
    let sched = TaskScheduler::new(
        exec.clone(),
        SchedulerConfig::default().with_tick_interval(Duration::from_millis(10)),
    );
    let id = sched
        .submit(task("job", TaskPriority::Medium).with_max_retries(0))
        .await
        .unwrap();

    sched.start().unwrap();
    assert!(sched
        .wait_for_task(&id, Duration::from_secs(5))
        .await
        .is_err());

    sched.resubmit(&id).await.unwrap();
    sched
        .wait_for_task(&id, Duration::from_secs(5))
        .await
        .unwrap();
    sched.stop().await;

    let t = sched.get_task(&id).await.unwrap();
    assert_eq!(t.status, TaskStatus::Completed);
    assert_eq!(t.error_count, 1);
    assert!(t.result.is_some());
}
