//! Test fixtures for integration tests.
//!
//! Provides:
//! - A scripted executor that records start/finish order and concurrency
//! - A switchable health probe
//! - Scheduler and task helpers

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crewline::core::{Task, TaskPriority};
use crewline::orchestration::{
    AgentInstance, ExecutionError, Executor, HealthProbe, ProbeResult, SchedulerConfig,
    TaskInput, TaskScheduler,
};

/// One entry of the executor log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Start(String),
    Finish(String),
}

/// Executor that records what it runs.
///
/// Each task id may be scripted to fail a number of times before it
/// succeeds; ids scripted with `u32::MAX` always fail.
#[derive(Default)]
pub struct RecordingExecutor {
    log: Mutex<Vec<Step>>,
    failures: Mutex<HashMap<String, u32>>,
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn fail_times(&self, id: &str, times: u32) {
        self.failures.lock().unwrap().insert(id.to_string(), times);
    }

    pub fn log(&self) -> Vec<Step> {
        self.log.lock().unwrap().clone()
    }

    /// Ids in the order their first attempt started.
    pub fn start_order(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.log()
            .into_iter()
            .filter_map(|s| match s {
                Step::Start(id) if seen.insert(id.clone()) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for RecordingExecutor {
    async fn execute(&self, input: TaskInput) -> Result<Value, ExecutionError> {
        let id = input.task_id.to_string();
        self.log.lock().unwrap().push(Step::Start(id.clone()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let fail = {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&id) {
                Some(remaining) if *remaining > 0 => {
                    if *remaining != u32::MAX {
                        *remaining -= 1;
                    }
                    true
                }
                _ => false,
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if fail {
            return Err(ExecutionError(format!("{} failed on attempt {}", id, input.attempt)));
        }
        self.log.lock().unwrap().push(Step::Finish(id.clone()));
        Ok(json!({ "id": id, "attempt": input.attempt }))
    }
}

/// Probe that reports healthy unless an instance has been switched off.
#[derive(Default)]
pub struct SwitchProbe {
    down: Mutex<HashSet<String>>,
}

impl SwitchProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, id: &str, down: bool) {
        let mut set = self.down.lock().unwrap();
        if down {
            set.insert(id.to_string());
        } else {
            set.remove(id);
        }
    }
}

#[async_trait]
impl HealthProbe for SwitchProbe {
    async fn probe(&self, instance: &AgentInstance) -> ProbeResult {
        if self.down.lock().unwrap().contains(&instance.id) {
            ProbeResult::unhealthy(Duration::from_millis(2), "connection refused")
        } else {
            ProbeResult::healthy(Duration::from_millis(2))
        }
    }
}

/// Scheduler with a short tick and backoff base of one second.
pub fn scheduler(executor: Arc<RecordingExecutor>, max_concurrent: usize) -> TaskScheduler {
    TaskScheduler::new(
        executor,
        SchedulerConfig::default()
            .with_max_concurrent(max_concurrent)
            .with_tick_interval(Duration::from_millis(10)),
    )
}

pub fn task(id: &str, priority: TaskPriority) -> Task {
    Task::new(id).with_id(id).with_priority(priority)
}
