//! Priority scheduler with bounded concurrency.
//!
//! The scheduler owns the task registry, a priority-ordered ready queue and
//! the set of in-flight task ids, all behind one mutex. A dispatch loop
//! ticks at a fixed interval, claims ready tasks in queue order up to the
//! concurrency limit, and runs each one against the configured executor
//! with per-attempt timeouts and exponential backoff between attempts.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::core::dag::TaskDAG;
use crate::core::task::{
    Dependency, Task, TaskId, TaskPriority, TaskStatus, DEFAULT_MAX_RETRIES, DEFAULT_TASK_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::metrics::{self, Metric, SharedSink};
use crate::orchestration::executor::{Executor, TaskInput};
use crate::util::{backoff_delay, secs_f64, with_timeout};
use crate::{log_debug, log_error, log_info, log_trace, log_warn};

/// Default dispatch tick.
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// Invoked with a snapshot of each task that completes successfully.
pub type CompletionCallback = Arc<dyn Fn(&Task) + Send + Sync>;

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of tasks executing at once.
    pub max_concurrent: usize,
    pub tick_interval: Duration,
    /// Used by `create_task` when the caller gives none.
    pub default_max_retries: u32,
    pub default_timeout: Duration,
    /// Delay before retry `n` is `backoff_base * 2^n`, capped at `backoff_max`.
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Polling interval of `wait_for_task` / `wait_for_all`.
    pub poll_interval: Duration,
    /// When set, waiting tasks whose dependencies are missing or can never
    /// be satisfied are failed after this long in the queue.
    pub dependency_ttl: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            tick_interval: DEFAULT_TICK,
            default_max_retries: DEFAULT_MAX_RETRIES,
            default_timeout: DEFAULT_TASK_TIMEOUT,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
            dependency_ttl: None,
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_tick_interval(mut self, tick: Duration) -> Self {
        self.tick_interval = tick;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    pub fn with_dependency_ttl(mut self, ttl: Duration) -> Self {
        self.dependency_ttl = Some(ttl);
        self
    }
}

/// Task lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    TaskSubmitted { task_id: TaskId },
    TaskDispatched { task_id: TaskId },
    TaskRetrying {
        task_id: TaskId,
        attempt: u32,
        error: String,
        delay: Duration,
    },
    TaskCompleted { task_id: TaskId },
    TaskFailed { task_id: TaskId, error: String },
    TaskCancelled { task_id: TaskId },
    TaskStarved { task_id: TaskId, dependency: TaskId },
}

/// Point-in-time view of scheduler counters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SchedulerStats {
    pub registered: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub failed: u64,
    pub retries: u64,
    pub total_execution_time: Duration,
}

impl SchedulerStats {
    /// Queued plus in-flight tasks.
    pub fn workload(&self) -> usize {
        self.queued + self.in_flight
    }
}

#[derive(Debug, Clone)]
struct QueueEntry {
    id: TaskId,
    priority: TaskPriority,
    queued_at: Instant,
}

struct SchedulerState {
    dag: TaskDAG,
    queue: Vec<QueueEntry>,
    in_flight: HashSet<TaskId>,
}

impl SchedulerState {
    /// Insert before the first entry of strictly lower priority, keeping
    /// submission order within a band.
    fn enqueue(&mut self, id: TaskId, priority: TaskPriority) {
        let entry = QueueEntry {
            id,
            priority,
            queued_at: Instant::now(),
        };
        match self.queue.iter().position(|e| e.priority > priority) {
            Some(pos) => self.queue.insert(pos, entry),
            None => self.queue.push(entry),
        }
    }

    fn dequeue(&mut self, id: &TaskId) -> Option<QueueEntry> {
        let pos = self.queue.iter().position(|e| &e.id == id)?;
        Some(self.queue.remove(pos))
    }
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    execution_micros: AtomicU64,
    peak_in_flight: AtomicUsize,
}

struct Inner {
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    executor: Arc<dyn Executor>,
    metrics: SharedSink,
    counters: Counters,
    events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
    on_complete: Option<CompletionCallback>,
    workers: TaskTracker,
}

struct LoopHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Builder for [`TaskScheduler`].
pub struct SchedulerBuilder {
    executor: Arc<dyn Executor>,
    config: SchedulerConfig,
    metrics: SharedSink,
    events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
    on_complete: Option<CompletionCallback>,
}

impl SchedulerBuilder {
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn metrics(mut self, sink: SharedSink) -> Self {
        self.metrics = sink;
        self
    }

    pub fn events(mut self, tx: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Task) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> TaskScheduler {
        TaskScheduler {
            inner: Arc::new(Inner {
                config: self.config,
                state: Mutex::new(SchedulerState {
                    dag: TaskDAG::new(),
                    queue: Vec::new(),
                    in_flight: HashSet::new(),
                }),
                executor: self.executor,
                metrics: self.metrics,
                counters: Counters::default(),
                events: self.events,
                on_complete: self.on_complete,
                workers: TaskTracker::new(),
            }),
            loop_handle: std::sync::Mutex::new(None),
        }
    }
}

/// Dependency-aware, priority-ordered task scheduler.
///
/// # Example
///
/// ```ignore
/// let scheduler = TaskScheduler::new(Arc::new(my_executor), SchedulerConfig::default());
/// let outline = scheduler.submit(Task::new("Outline the article"))?;
/// scheduler.submit(Task::new("Draft").with_dependency(outline.clone(), DependencyType::Data))?;
/// scheduler.start()?;
/// let results = scheduler.wait_for_all(Duration::from_secs(60)).await?;
/// scheduler.stop().await;
/// ```
pub struct TaskScheduler {
    inner: Arc<Inner>,
    loop_handle: std::sync::Mutex<Option<LoopHandle>>,
}

impl TaskScheduler {
    pub fn new(executor: Arc<dyn Executor>, config: SchedulerConfig) -> Self {
        Self::builder(executor).config(config).build()
    }

    pub fn builder(executor: Arc<dyn Executor>) -> SchedulerBuilder {
        SchedulerBuilder {
            executor,
            config: SchedulerConfig::default(),
            metrics: metrics::default_sink(),
            events: None,
            on_complete: None,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Register a task and queue it for dispatch.
    pub async fn submit(&self, task: Task) -> Result<TaskId> {
        let id = task.id.clone();
        let priority = task.priority;
        {
            let mut state = self.inner.state.lock().await;
            state.dag.add_task(task)?;
            state.enqueue(id.clone(), priority);
        }
        log_debug!("Scheduler: submitted task={} priority={}", id, priority);
        self.inner.emit(SchedulerEvent::TaskSubmitted {
            task_id: id.clone(),
        });
        Ok(id)
    }

    /// Build and submit a task, falling back to configured defaults for
    /// retries and timeout.
    pub async fn create_task(
        &self,
        description: &str,
        priority: TaskPriority,
        dependencies: Vec<Dependency>,
        max_retries: Option<u32>,
        timeout: Option<Duration>,
    ) -> Result<TaskId> {
        let mut task = Task::new(description)
            .with_priority(priority)
            .with_max_retries(max_retries.unwrap_or(self.inner.config.default_max_retries))
            .with_timeout(timeout.unwrap_or(self.inner.config.default_timeout));
        task.dependencies = dependencies;
        self.submit(task).await
    }

    /// Snapshot of a task.
    pub async fn get_task(&self, id: &TaskId) -> Option<Task> {
        self.inner.state.lock().await.dag.get_task(id).cloned()
    }

    pub async fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.inner
            .state
            .lock()
            .await
            .dag
            .get_task(id)
            .map(|t| t.status)
    }

    /// Snapshot of every registered task in submission order.
    pub async fn tasks(&self) -> Vec<Task> {
        let state = self.inner.state.lock().await;
        state.dag.all_tasks().into_iter().cloned().collect()
    }

    pub async fn is_ready(&self, id: &TaskId) -> bool {
        self.inner.state.lock().await.dag.is_ready(id)
    }

    /// Ids in the ready queue, in dispatch order.
    pub async fn queued(&self) -> Vec<TaskId> {
        let state = self.inner.state.lock().await;
        state.queue.iter().map(|e| e.id.clone()).collect()
    }

    pub async fn in_flight(&self) -> Vec<TaskId> {
        let state = self.inner.state.lock().await;
        state.in_flight.iter().cloned().collect()
    }

    /// Queued plus in-flight task count.
    pub async fn workload(&self) -> usize {
        let state = self.inner.state.lock().await;
        state.queue.len() + state.in_flight.len()
    }

    pub async fn stats(&self) -> SchedulerStats {
        let (registered, queued, in_flight) = {
            let state = self.inner.state.lock().await;
            (
                state.dag.task_count(),
                state.queue.len(),
                state.in_flight.len(),
            )
        };
        let c = &self.inner.counters;
        SchedulerStats {
            registered,
            queued,
            in_flight,
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            total_execution_time: Duration::from_micros(
                c.execution_micros.load(Ordering::Relaxed),
            ),
        }
    }

    /// Highest in-flight count ever observed.
    pub fn peak_in_flight(&self) -> usize {
        self.inner.counters.peak_in_flight.load(Ordering::Relaxed)
    }

    /// Run one dispatch pass. Returns the number of tasks launched.
    pub async fn dispatch_ready(&self) -> usize {
        Arc::clone(&self.inner).dispatch_ready().await
    }

    /// Execute a ready task immediately, outside the dispatch loop.
    ///
    /// The task still takes an in-flight slot.
    ///
    /// # Errors
    /// - `TaskNotReady` if its dependencies do not hold; a waiting task is
    ///   marked `Blocked`
    /// - `AtCapacity` if every slot is taken
    /// - `TaskExecutionFailed` once all attempts are exhausted
    pub async fn execute_task(&self, id: &TaskId) -> Result<Value> {
        {
            let mut state = self.inner.state.lock().await;
            let task = state
                .dag
                .get_task(id)
                .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
            if !state.dag.is_ready(id) {
                if matches!(task.status, TaskStatus::Pending | TaskStatus::Blocked) {
                    if let Some(task) = state.dag.get_task_mut(id) {
                        task.block("dependencies not satisfied");
                    }
                }
                log_warn!("Scheduler: execute_task on unready task={}", id);
                return Err(Error::TaskNotReady(id.clone()));
            }
            if state.in_flight.len() >= self.inner.config.max_concurrent {
                return Err(Error::AtCapacity {
                    max: self.inner.config.max_concurrent,
                });
            }
            self.inner.claim(&mut state, id);
        }
        Arc::clone(&self.inner).execute_claimed(id.clone()).await
    }

    /// Cancel a task that has not started. Running and finished tasks are
    /// left alone and `false` is returned.
    pub async fn cancel_task(&self, id: &TaskId) -> Result<bool> {
        {
            let mut state = self.inner.state.lock().await;
            let status = state
                .dag
                .get_task(id)
                .map(|t| t.status)
                .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
            if !matches!(status, TaskStatus::Pending | TaskStatus::Blocked) {
                return Ok(false);
            }
            state.dequeue(id);
            if let Some(task) = state.dag.get_task_mut(id) {
                task.cancel();
            }
        }
        log_info!("Scheduler: cancelled task={}", id);
        self.inner
            .emit(SchedulerEvent::TaskCancelled { task_id: id.clone() });
        Ok(true)
    }

    /// Take a waiting task out of the queue without changing its status.
    /// It stays registered and queryable but is never dispatched.
    pub async fn dequeue(&self, id: &TaskId) -> bool {
        self.inner.state.lock().await.dequeue(id).is_some()
    }

    /// Put a failed or cancelled task back in the queue.
    pub async fn resubmit(&self, id: &TaskId) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let task = state
            .dag
            .get_task_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        if !matches!(task.status, TaskStatus::Failed | TaskStatus::Cancelled) {
            return Err(Error::Validation(format!(
                "task {} is {} and cannot be resubmitted",
                id, task.status
            )));
        }
        task.reset();
        let priority = task.priority;
        state.enqueue(id.clone(), priority);
        log_info!("Scheduler: resubmitted task={}", id);
        Ok(())
    }

    /// Change a task's priority, moving it within the queue if queued.
    pub async fn set_priority(&self, id: &TaskId, priority: TaskPriority) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let task = state
            .dag
            .get_task_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        task.priority = priority;
        if let Some(entry) = state.dequeue(id) {
            let queued_at = entry.queued_at;
            state.enqueue(id.clone(), priority);
            if let Some(e) = state.queue.iter_mut().find(|e| &e.id == id) {
                e.queued_at = queued_at;
            }
        }
        Ok(())
    }

    /// Drop finished tasks nothing live depends on. Returns the purged ids.
    pub async fn purge_finished(&self) -> Vec<TaskId> {
        let mut state = self.inner.state.lock().await;
        let finished: Vec<TaskId> = state
            .dag
            .all_tasks()
            .into_iter()
            .filter(|t| t.is_finished())
            .map(|t| t.id.clone())
            .collect();
        // Dependents first, so their predecessors become unreferenced.
        let mut purged = Vec::new();
        for id in finished.iter().rev() {
            if state.dag.remove_task(id).is_some() {
                purged.push(id.clone());
            }
        }
        purged.reverse();
        purged
    }

    /// Waiting tasks paired with a dependency that is missing or can no
    /// longer be satisfied.
    pub async fn starved_tasks(&self) -> Vec<(TaskId, TaskId)> {
        let state = self.inner.state.lock().await;
        state
            .dag
            .all_tasks()
            .into_iter()
            .filter_map(|t| {
                state
                    .dag
                    .starved_dependency(&t.id)
                    .map(|dep| (t.id.clone(), dep))
            })
            .collect()
    }

    /// Registered tasks in dependency order.
    pub async fn topological_order(&self) -> Result<Vec<TaskId>> {
        let state = self.inner.state.lock().await;
        Ok(state
            .dag
            .topological_order()?
            .into_iter()
            .map(|t| t.id.clone())
            .collect())
    }

    /// Poll until the task reaches a terminal state or `timeout` elapses.
    pub async fn wait_for_task(&self, id: &TaskId, timeout: Duration) -> Result<Value> {
        let deadline = Instant::now() + timeout;
        loop {
            let last_error = {
                let state = self.inner.state.lock().await;
                let task = state
                    .dag
                    .get_task(id)
                    .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
                match task.status {
                    TaskStatus::Completed => {
                        return Ok(task.result.clone().unwrap_or(Value::Null));
                    }
                    TaskStatus::Failed => {
                        return Err(Error::TaskExecutionFailed {
                            id: id.clone(),
                            error: task
                                .last_error
                                .clone()
                                .unwrap_or_else(|| "unknown error".to_string()),
                        });
                    }
                    TaskStatus::Cancelled => return Err(Error::TaskCancelled(id.clone())),
                    _ => task.last_error.clone(),
                }
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::TimeoutExceeded {
                    after: timeout,
                    last_error,
                });
            }
            tokio::time::sleep(self.inner.config.poll_interval.min(deadline - now)).await;
        }
    }

    /// Poll until every registered task is terminal, then return the
    /// results of the completed ones.
    ///
    /// Failed and cancelled tasks are not errors here; inspect their status.
    /// A task starving on a dependency keeps this waiting until `timeout`.
    pub async fn wait_for_all(&self, timeout: Duration) -> Result<HashMap<TaskId, Value>> {
        let deadline = Instant::now() + timeout;
        loop {
            let last_error = {
                let state = self.inner.state.lock().await;
                let tasks = state.dag.all_tasks();
                if state.in_flight.is_empty() && tasks.iter().all(|t| t.is_finished()) {
                    return Ok(tasks
                        .into_iter()
                        .filter_map(|t| t.result.clone().map(|r| (t.id.clone(), r)))
                        .collect());
                }
                tasks
                    .iter()
                    .filter(|t| !t.is_finished())
                    .find_map(|t| t.last_error.clone())
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::TimeoutExceeded {
                    after: timeout,
                    last_error,
                });
            }
            tokio::time::sleep(self.inner.config.poll_interval.min(deadline - now)).await;
        }
    }

    /// Start the background dispatch loop.
    pub fn start(&self) -> Result<()> {
        let mut guard = self
            .loop_handle
            .lock()
            .map_err(|_| Error::Validation("scheduler loop handle poisoned".to_string()))?;
        if guard.is_some() {
            return Err(Error::AlreadyRunning("scheduler"));
        }

        let cancel = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let join = tokio::spawn(inner.run_loop(cancel.clone()));
        *guard = Some(LoopHandle { cancel, join });
        log_info!(
            "Scheduler: dispatch loop started (max_concurrent={}, tick={:?})",
            self.inner.config.max_concurrent,
            self.inner.config.tick_interval
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.loop_handle
            .lock()
            .map(|g| g.is_some())
            .unwrap_or(false)
    }

    /// Stop the dispatch loop and wait for in-flight executions to finish.
    pub async fn stop(&self) {
        let handle = match self.loop_handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(handle) = handle else {
            return;
        };
        handle.cancel.cancel();
        if let Err(e) = handle.join.await {
            log_error!("Scheduler: dispatch loop ended abnormally: {}", e);
        }
        log_info!("Scheduler: dispatch loop stopped");
    }
}

impl Inner {
    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Move a ready task from the queue into the in-flight set.
    fn claim(&self, state: &mut SchedulerState, id: &TaskId) {
        state.dequeue(id);
        if let Some(task) = state.dag.get_task_mut(id) {
            task.mark_ready();
        }
        state.in_flight.insert(id.clone());
        self.counters
            .peak_in_flight
            .fetch_max(state.in_flight.len(), Ordering::Relaxed);
    }

    async fn dispatch_ready(self: Arc<Self>) -> usize {
        let (claimed, starved) = {
            let mut state = self.state.lock().await;
            let starved = self.fail_starved(&mut state);

            let mut claimed = Vec::new();
            if state.in_flight.len() < self.config.max_concurrent {
                let candidates: Vec<TaskId> =
                    state.queue.iter().map(|e| e.id.clone()).collect();
                for id in candidates {
                    if state.in_flight.len() >= self.config.max_concurrent {
                        break;
                    }
                    if state.dag.is_ready(&id) {
                        self.claim(&mut state, &id);
                        claimed.push(id);
                    }
                }
            } else {
                log_trace!("Scheduler: at capacity, skipping tick");
            }
            (claimed, starved)
        };

        for (task_id, dependency) in starved {
            self.emit(SchedulerEvent::TaskStarved {
                task_id,
                dependency,
            });
        }

        for id in &claimed {
            log_debug!("Scheduler: dispatching task={}", id);
            self.emit(SchedulerEvent::TaskDispatched { task_id: id.clone() });
            let inner = Arc::clone(&self);
            let id = id.clone();
            self.workers.spawn(async move {
                // Failures are recorded on the task; nothing to propagate.
                let _ = inner.execute_claimed(id).await;
            });
        }
        claimed.len()
    }

    /// Fail queued tasks that have starved past the configured TTL.
    fn fail_starved(&self, state: &mut SchedulerState) -> Vec<(TaskId, TaskId)> {
        let Some(ttl) = self.config.dependency_ttl else {
            return Vec::new();
        };
        let now = Instant::now();
        let expired: Vec<(TaskId, TaskId)> = state
            .queue
            .iter()
            .filter(|e| now.duration_since(e.queued_at) >= ttl)
            .filter_map(|e| {
                state
                    .dag
                    .starved_dependency(&e.id)
                    .map(|dep| (e.id.clone(), dep))
            })
            .collect();

        for (id, dep) in &expired {
            state.dequeue(id);
            let error = Error::DependencyStarved {
                id: id.clone(),
                dependency: dep.clone(),
            }
            .to_string();
            if let Some(task) = state.dag.get_task_mut(id) {
                task.fail(&error);
            }
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            self.metrics
                .emit(Metric::count(metrics::TASK_FAILED).label("task", id).label("reason", "starved"));
            log_warn!("Scheduler: {}", error);
        }
        expired
    }

    /// Run all attempts of a claimed task.
    async fn execute_claimed(self: Arc<Self>, id: TaskId) -> Result<Value> {
        let (base_input, max_retries, timeout) = {
            let mut state = self.state.lock().await;
            let context = state.dag.dependency_results(&id);
            let Some(task) = state.dag.get_task_mut(&id) else {
                state.in_flight.remove(&id);
                return Err(Error::TaskNotFound(id));
            };
            task.start();
            (
                TaskInput::from_task(task, context),
                task.max_retries,
                task.timeout,
            )
        };

        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            let mut input = base_input.clone();
            input.attempt = attempt;

            let outcome = match with_timeout(timeout, self.executor.execute(input)).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(e.0),
                Err(_) => Err(format!("attempt timed out after {:?}", timeout)),
            };

            match outcome {
                Ok(value) => {
                    self.finish_success(&id, value.clone(), started.elapsed())
                        .await;
                    return Ok(value);
                }
                Err(error) => {
                    let retry = {
                        let mut state = self.state.lock().await;
                        match state.dag.get_task_mut(&id) {
                            Some(task) => {
                                task.record_error(&error);
                                if attempt < max_retries {
                                    task.retry_count += 1;
                                }
                            }
                            None => {
                                state.in_flight.remove(&id);
                                return Err(Error::TaskNotFound(id));
                            }
                        }
                        attempt < max_retries
                    };

                    if !retry {
                        return Err(self.finish_failure(&id, error, started.elapsed()).await);
                    }

                    let delay =
                        backoff_delay(self.config.backoff_base, self.config.backoff_max, attempt);
                    log_warn!(
                        "Scheduler: task={} attempt={} failed: {} (retrying in {:?})",
                        id,
                        attempt,
                        error,
                        delay
                    );
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    self.metrics.emit(
                        Metric::count(metrics::TASK_RETRY)
                            .label("task", &id)
                            .label("attempt", attempt),
                    );
                    self.emit(SchedulerEvent::TaskRetrying {
                        task_id: id.clone(),
                        attempt,
                        error,
                        delay,
                    });
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn finish_success(&self, id: &TaskId, value: Value, elapsed: Duration) {
        let snapshot = {
            let mut state = self.state.lock().await;
            state.in_flight.remove(id);
            state.dag.get_task_mut(id).map(|task| {
                task.complete(value);
                task.clone()
            })
        };

        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .execution_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.metrics
            .emit(Metric::count(metrics::TASK_COMPLETED).label("task", id));
        self.metrics.emit(
            Metric::new(metrics::TASK_EXECUTION_TIME, secs_f64(elapsed)).label("task", id),
        );
        log_info!("Scheduler: task={} completed in {:?}", id, elapsed);

        if let (Some(callback), Some(task)) = (&self.on_complete, snapshot) {
            callback(&task);
        }
        self.emit(SchedulerEvent::TaskCompleted { task_id: id.clone() });
    }

    async fn finish_failure(&self, id: &TaskId, error: String, elapsed: Duration) -> Error {
        {
            let mut state = self.state.lock().await;
            state.in_flight.remove(id);
            if let Some(task) = state.dag.get_task_mut(id) {
                task.fail(&error);
            }
        }

        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .execution_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.metrics
            .emit(Metric::count(metrics::TASK_FAILED).label("task", id));
        log_error!("Scheduler: task={} failed: {}", id, error);
        self.emit(SchedulerEvent::TaskFailed {
            task_id: id.clone(),
            error: error.clone(),
        });
        Error::TaskExecutionFailed {
            id: id.clone(),
            error,
        }
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    // A panicking tick must not take the loop down.
                    let tick = tokio::spawn(Arc::clone(&self).dispatch_ready());
                    if let Err(e) = tick.await {
                        log_error!("Scheduler: dispatch tick failed: {}", e);
                        tokio::time::sleep(self.config.tick_interval * 10).await;
                    }
                }
            }
        }

        // Drain in-flight executions before reporting stopped.
        self.workers.close();
        self.workers.wait().await;
        self.workers.reopen();
    }
}
