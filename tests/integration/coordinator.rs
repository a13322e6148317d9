//! Coordinator scenarios: crews backed by real schedulers, scaling advice,
//! failover health and conflicts that feed back into dispatch order.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crewline::core::{TaskId, TaskPriority};
use crewline::metrics::{self, MemorySink};
use crewline::orchestration::{
    AgentInstance, ConflictContext, ConflictType, Coordinator, CoordinatorConfig,
    CoordinatorEvent, FailoverConfig, FailoverManager, ScalingAction, ScalingConfig,
    ScalingPolicy,
};

use crate::fixtures::{scheduler, task, RecordingExecutor, SwitchProbe};

fn names(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

/// Given a crew with a deep backlog and a workload scaling policy
/// When the coordinator ticks twice without cool-down
/// Then it recommends scaling up each time, within the worker bounds
#[tokio::test(start_paused = true)]
async fn test_backlog_scales_crew_up() {
    let sink = Arc::new(MemorySink::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let coordinator = Coordinator::builder()
        .scaling(
            ScalingConfig::default()
                .with_policies(vec![ScalingPolicy::Workload])
                .with_worker_bounds(1, 3)
                .with_cooldown(Duration::ZERO),
        )
        .metrics(sink.clone())
        .events(tx)
        .build();

    let sched = Arc::new(scheduler(Arc::new(RecordingExecutor::new()), 2));
    for i in 0..12 {
        sched
            .submit(task(&format!("job-{}", i), TaskPriority::Medium))
            .await
            .unwrap();
    }
    coordinator.add_crew("batch", sched, 2, None).await.unwrap();

    for _ in 0..3 {
        let summary = coordinator.tick().await;
        assert_eq!(summary.evaluated, 1);
        assert_eq!(summary.failed, 0);
    }

    let m = coordinator.crew_metrics("batch").await.unwrap();
    assert_eq!(m.workload, 12);
    assert_eq!(m.worker_pool_size, 3);
    assert_eq!(m.scaling_events, 3);
    assert_eq!(m.resource_utilization, 1.0);
    assert_eq!(sink.total(metrics::SCALING_EVENT), 3.0);

    let mut moves = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let CoordinatorEvent::ScalingRecommended {
            decision,
            from_workers,
            to_workers,
            ..
        } = event
        {
            assert_eq!(decision.action, ScalingAction::ScaleUp);
            assert_eq!(decision.policy, ScalingPolicy::Workload);
            moves.push((from_workers, to_workers));
        }
    }
    // The last recommendation is clamped at the upper bound.
    assert_eq!(moves, vec![(2, 3), (3, 3), (3, 3)]);
}

/// Given two tasks whose priorities are in conflict and a third task
/// When the conflict is resolved before the crew starts
/// Then both take the converged priority and dispatch follows it
#[tokio::test(start_paused = true)]
async fn test_priority_conflict_reorders_dispatch() {
    let coordinator = Coordinator::new(CoordinatorConfig::default().with_auto_scaling(false));
    let exec = Arc::new(RecordingExecutor::new());
    let sched = Arc::new(scheduler(Arc::clone(&exec), 1));
    sched.submit(task("x", TaskPriority::Critical)).await.unwrap();
    sched.submit(task("y", TaskPriority::Low)).await.unwrap();
    sched.submit(task("z", TaskPriority::High)).await.unwrap();
    coordinator
        .add_crew("docs", Arc::clone(&sched), 1, None)
        .await
        .unwrap();

    let resolution = coordinator
        .handle_conflict(
            "docs",
            ConflictType::Priority,
            &names(&["x", "y"]),
            ConflictContext::new(),
        )
        .await
        .unwrap();
    assert_eq!(resolution.outcome.converged_priority(), Some(2.5));

    for id in ["x", "y"] {
        let t = sched.get_task(&TaskId::from(id)).await.unwrap();
        assert_eq!(t.priority, TaskPriority::Medium);
    }

    sched.start().unwrap();
    sched.wait_for_all(Duration::from_secs(10)).await.unwrap();
    coordinator.shutdown().await;

    assert_eq!(exec.start_order(), vec!["z", "x", "y"]);
    assert_eq!(
        coordinator.crew_metrics("docs").await.unwrap().conflicts_resolved,
        1
    );
}

/// Given a crew bound to an agent pool
/// When every instance of the pool goes down
/// Then each tick reports the pool as degraded until an instance recovers
#[tokio::test(start_paused = true)]
async fn test_degraded_pool_reported_per_tick() {
    let probe = Arc::new(SwitchProbe::new());
    let failover = Arc::new(FailoverManager::new(
        probe.clone(),
        FailoverConfig::default()
            .with_cooldown(Duration::from_secs(10))
            .with_recovery(false, Duration::from_secs(1)),
    ));
    failover.add_instance(AgentInstance::new("r1", "research", 1)).await;
    failover.add_instance(AgentInstance::new("r2", "research", 2)).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let coordinator = Coordinator::builder()
        .config(CoordinatorConfig::default().with_auto_scaling(false))
        .failover(Arc::clone(&failover))
        .events(tx)
        .build();
    let sched = Arc::new(scheduler(Arc::new(RecordingExecutor::new()), 1));
    coordinator
        .add_crew("research", sched, 1, Some("research"))
        .await
        .unwrap();

    probe.set_down("r1", true);
    probe.set_down("r2", true);
    failover.run_health_check().await;
    coordinator.tick().await;

    match rx.try_recv().unwrap() {
        CoordinatorEvent::FailoverDegraded { crew, agent, error } => {
            assert_eq!(crew, "research");
            assert_eq!(agent, "research");
            assert!(error.contains("No healthy alternative"));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    probe.set_down("r2", false);
    tokio::time::advance(Duration::from_secs(11)).await;
    failover.run_health_check().await;
    coordinator.tick().await;

    assert!(rx.try_recv().is_err());
    assert_eq!(failover.active_instance("research").await.unwrap().id, "r2");
}

/// Given a running coordinator loop over a running crew
/// When the crew works through its tasks
/// Then crew metrics catch up with the scheduler and shutdown stops both
#[tokio::test(start_paused = true)]
async fn test_loop_tracks_crew_progress() {
    let coordinator = Coordinator::new(
        CoordinatorConfig::default()
            .with_tick_interval(Duration::from_secs(1))
            .with_auto_scaling(false),
    );
    let exec = Arc::new(RecordingExecutor::with_delay(Duration::from_millis(100)));
    exec.fail_times("bad", u32::MAX);
    let sched = Arc::new(scheduler(Arc::clone(&exec), 2));
    for id in ["a", "b", "c"] {
        sched.submit(task(id, TaskPriority::Medium)).await.unwrap();
    }
    sched
        .submit(task("bad", TaskPriority::Medium).with_max_retries(0))
        .await
        .unwrap();

    coordinator
        .add_crew("ops", Arc::clone(&sched), 2, None)
        .await
        .unwrap();
    sched.start().unwrap();
    coordinator.start().unwrap();
    assert!(coordinator.start().is_err());

    tokio::time::sleep(Duration::from_secs(5)).await;
    let m = coordinator.crew_metrics("ops").await.unwrap();
    assert_eq!(m.tasks_completed, 3);
    assert_eq!(m.tasks_failed, 1);
    assert_eq!(m.workload, 0);
    assert!(m.total_execution_time >= Duration::from_millis(300));

    coordinator.shutdown().await;
    assert!(!coordinator.is_running());
    assert!(!sched.is_running());
}
