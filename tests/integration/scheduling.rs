//! Scheduling scenarios: priority order, dependency gating and the
//! concurrency bound, driven through the scheduler loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use crewline::core::{DependencyType, TaskId, TaskPriority, TaskStatus};
use crewline::Error;

use crate::fixtures::{scheduler, task, RecordingExecutor, Step};

/// Given three ready tasks submitted as LOW, HIGH, MEDIUM
/// When the loop runs them one at a time
/// Then they start in priority order HIGH, MEDIUM, LOW
#[tokio::test(start_paused = true)]
async fn test_ready_tasks_start_in_priority_order() {
    let exec = Arc::new(RecordingExecutor::new());
    let sched = scheduler(Arc::clone(&exec), 1);

    sched.submit(task("low", TaskPriority::Low)).await.unwrap();
    sched.submit(task("high", TaskPriority::High)).await.unwrap();
    sched.submit(task("medium", TaskPriority::Medium)).await.unwrap();

    sched.start().unwrap();
    sched.wait_for_all(Duration::from_secs(10)).await.unwrap();
    sched.stop().await;

    assert_eq!(exec.start_order(), vec!["high", "medium", "low"]);
}

/// Given equal-priority tasks
/// When they are dispatched one at a time
/// Then they start in submission order
#[tokio::test(start_paused = true)]
async fn test_equal_priority_is_fifo() {
    let exec = Arc::new(RecordingExecutor::new());
    let sched = scheduler(Arc::clone(&exec), 1);

    for id in ["first", "second", "third"] {
        sched.submit(task(id, TaskPriority::Medium)).await.unwrap();
    }

    sched.start().unwrap();
    sched.wait_for_all(Duration::from_secs(10)).await.unwrap();
    sched.stop().await;

    assert_eq!(exec.start_order(), vec!["first", "second", "third"]);
}

/// Given A and B where B requires A to complete
/// When A fails with no retries left
/// Then B never leaves PENDING and is never executed
#[tokio::test(start_paused = true)]
async fn test_failed_predecessor_keeps_dependent_pending() {
    let exec = Arc::new(RecordingExecutor::new());
    exec.fail_times("a", u32::MAX);
    let sched = scheduler(Arc::clone(&exec), 2);

    sched
        .submit(task("a", TaskPriority::Medium).with_max_retries(0))
        .await
        .unwrap();
    sched
        .submit(task("b", TaskPriority::Critical).depends_on("a"))
        .await
        .unwrap();
    sched.start().unwrap();

    let a = TaskId::from("a");
    let b = TaskId::from("b");
    let err = sched
        .wait_for_task(&a, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TaskExecutionFailed { .. }));

    // Give the loop plenty of ticks to misbehave.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(sched.status(&b).await, Some(TaskStatus::Pending));
    assert!(!exec.start_order().contains(&"b".to_string()));

    let res = sched.wait_for_all(Duration::from_millis(200)).await;
    assert!(matches!(res, Err(Error::TimeoutExceeded { .. })));
    assert_eq!(sched.starved_tasks().await, vec![(b, a)]);
    sched.stop().await;
}

/// Given a data dependency
/// When the predecessor completes
/// Then the dependent sees its result in the execution context
#[tokio::test(start_paused = true)]
async fn test_data_dependency_chain_completes() {
    let exec = Arc::new(RecordingExecutor::new());
    let sched = scheduler(Arc::clone(&exec), 4);

    sched.submit(task("fetch", TaskPriority::Medium)).await.unwrap();
    sched
        .submit(task("parse", TaskPriority::Medium).with_dependency("fetch", DependencyType::Data))
        .await
        .unwrap();
    sched
        .submit(task("report", TaskPriority::Medium).depends_on("parse"))
        .await
        .unwrap();

    sched.start().unwrap();
    let results = sched.wait_for_all(Duration::from_secs(10)).await.unwrap();
    sched.stop().await;

    assert_eq!(results.len(), 3);
    assert_eq!(exec.start_order(), vec!["fetch", "parse", "report"]);
    assert_eq!(sched.stats().await.completed, 3);
}

/// Given several producers submitting tasks concurrently while the loop runs
/// When every task takes a while to execute
/// Then no more than max_concurrent tasks ever run at once
#[tokio::test(start_paused = true)]
async fn test_concurrency_bound_under_concurrent_submission() {
    let exec = Arc::new(RecordingExecutor::with_delay(Duration::from_millis(50)));
    let sched = Arc::new(scheduler(Arc::clone(&exec), 3));
    sched.start().unwrap();

    let mut producers = Vec::new();
    for p in 0..4 {
        let sched = Arc::clone(&sched);
        producers.push(tokio::spawn(async move {
            for i in 0..6 {
                let priority = TaskPriority::ALL[(p + i) % TaskPriority::ALL.len()];
                sched
                    .submit(task(&format!("p{}-{}", p, i), priority))
                    .await
                    .unwrap();
                tokio::time::sleep(Duration::from_millis(7 * (p as u64 + 1))).await;
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    let results = sched.wait_for_all(Duration::from_secs(30)).await.unwrap();
    sched.stop().await;

    assert_eq!(results.len(), 24);
    assert!(exec.peak() <= 3, "executor saw {} at once", exec.peak());
    assert!(sched.peak_in_flight() <= 3);
    assert!(sched.peak_in_flight() >= 2);
}

fn dag_case() -> impl Strategy<Value = (Vec<(u8, Vec<prop::sample::Index>)>, usize)> {
    (
        prop::collection::vec(
            (1u8..=5, prop::collection::vec(any::<prop::sample::Index>(), 0..3)),
            1..10,
        ),
        1usize..4,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Random DAGs with random priorities: no task starts before each of
    /// its predecessors has finished, and the concurrency bound holds.
    #[test]
    fn prop_tasks_start_after_dependencies((nodes, max_concurrent) in dag_case()) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();

        let mut edges: HashMap<String, Vec<String>> = HashMap::new();
        let (log, peak) = rt.block_on(async {
            let exec = Arc::new(RecordingExecutor::with_delay(Duration::from_millis(5)));
            let sched = scheduler(Arc::clone(&exec), max_concurrent);

            for (i, (priority, picks)) in nodes.iter().enumerate() {
                let id = format!("t{}", i);
                let mut t = task(&id, TaskPriority::from_ordinal(*priority).unwrap());
                let mut deps: Vec<String> = Vec::new();
                if i > 0 {
                    for pick in picks {
                        let dep = format!("t{}", pick.index(i));
                        if !deps.contains(&dep) {
                            t = t.depends_on(dep.as_str());
                            deps.push(dep);
                        }
                    }
                }
                edges.insert(id, deps);
                sched.submit(t).await.unwrap();
            }

            sched.start().unwrap();
            sched.wait_for_all(Duration::from_secs(60)).await.unwrap();
            sched.stop().await;
            (exec.log(), exec.peak())
        });

        prop_assert!(peak <= max_concurrent);
        let position = |step: &Step| log.iter().position(|s| s == step);
        for (id, deps) in &edges {
            let started = position(&Step::Start(id.clone())).unwrap();
            for dep in deps {
                let finished = position(&Step::Finish(dep.clone())).unwrap();
                prop_assert!(
                    finished < started,
                    "{} started before {} finished",
                    id,
                    dep
                );
            }
        }
    }
}
