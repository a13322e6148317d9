//! Periodic coordination of crews.
//!
//! A crew is a scheduler plus the worker capacity behind it and, optionally,
//! the agent pool it runs on. Each coordinator tick refreshes every crew's
//! metrics from its scheduler, asks the scaling manager for a
//! recommendation, and reports pools that are running degraded. Conflicts
//! are resolved on demand through [`Coordinator::handle_conflict`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::task::{TaskId, TaskPriority};
use crate::error::{Error, Result};
use crate::metrics::{self, Metric, SharedSink};
use crate::orchestration::failover::FailoverManager;
use crate::orchestration::resolver::{
    ConflictContext, ConflictResolution, ConflictResolver, ConflictType,
};
use crate::orchestration::scaling::{ScalingConfig, ScalingDecision, ScalingManager, ScalingMetrics};
use crate::orchestration::scheduler::TaskScheduler;
use crate::{log_debug, log_error, log_info, log_warn};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub tick_interval: Duration,
    /// Pause after a tick in which some crew failed to evaluate.
    pub error_backoff: Duration,
    pub auto_scaling: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
            auto_scaling: true,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_tick_interval(mut self, tick: Duration) -> Self {
        self.tick_interval = tick;
        self
    }

    pub fn with_auto_scaling(mut self, enabled: bool) -> Self {
        self.auto_scaling = enabled;
        self
    }
}

/// Aggregate figures for one crew.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CrewMetrics {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub total_execution_time: Duration,
    pub conflicts_resolved: u64,
    pub scaling_events: u64,
    /// Workload over worker pool size, capped at 1.
    pub resource_utilization: f64,
    pub workload: usize,
    pub worker_pool_size: usize,
}

impl CrewMetrics {
    fn scaling_input(&self) -> ScalingMetrics {
        ScalingMetrics {
            tasks_completed: self.tasks_completed,
            tasks_failed: self.tasks_failed,
            total_execution_time: self.total_execution_time,
            workload: self.workload,
            resource_utilization: self.resource_utilization,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    ScalingRecommended {
        crew: String,
        decision: ScalingDecision,
        from_workers: usize,
        to_workers: usize,
    },
    ConflictResolved {
        crew: String,
        resolution: ConflictResolution,
    },
    FailoverDegraded {
        crew: String,
        agent: String,
        error: String,
    },
    TickFailed {
        crew: String,
        error: String,
    },
}

/// Outcome of one coordinator tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub evaluated: usize,
    pub failed: usize,
}

struct Crew {
    scheduler: Arc<TaskScheduler>,
    failover_agent: Option<String>,
    metrics: CrewMetrics,
    last_scaled: Option<Instant>,
}

struct Inner {
    config: CoordinatorConfig,
    scaling: ScalingManager,
    resolver: ConflictResolver,
    failover: Option<Arc<FailoverManager>>,
    crews: Mutex<BTreeMap<String, Crew>>,
    events: Option<mpsc::UnboundedSender<CoordinatorEvent>>,
    metrics: SharedSink,
}

struct LoopHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    scaling: ScalingConfig,
    failover: Option<Arc<FailoverManager>>,
    events: Option<mpsc::UnboundedSender<CoordinatorEvent>>,
    metrics: SharedSink,
}

impl CoordinatorBuilder {
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn scaling(mut self, scaling: ScalingConfig) -> Self {
        self.scaling = scaling;
        self
    }

    pub fn failover(mut self, manager: Arc<FailoverManager>) -> Self {
        self.failover = Some(manager);
        self
    }

    pub fn events(mut self, tx: mpsc::UnboundedSender<CoordinatorEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn metrics(mut self, sink: SharedSink) -> Self {
        self.metrics = sink;
        self
    }

    pub fn build(self) -> Coordinator {
        Coordinator {
            inner: Arc::new(Inner {
                config: self.config,
                scaling: ScalingManager::new(self.scaling),
                resolver: ConflictResolver::new(Arc::clone(&self.metrics)),
                failover: self.failover,
                crews: Mutex::new(BTreeMap::new()),
                events: self.events,
                metrics: self.metrics,
            }),
            loop_handle: std::sync::Mutex::new(None),
        }
    }
}

/// Drives scaling evaluation and conflict handling for a set of crews.
pub struct Coordinator {
    inner: Arc<Inner>,
    loop_handle: std::sync::Mutex<Option<LoopHandle>>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder {
            config: CoordinatorConfig::default(),
            scaling: ScalingConfig::default(),
            failover: None,
            events: None,
            metrics: metrics::default_sink(),
        }
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.inner.resolver
    }

    pub fn scaling(&self) -> &ScalingManager {
        &self.inner.scaling
    }

    /// Register a crew. `failover_agent` names the agent pool whose health
    /// is reported for this crew.
    pub async fn add_crew(
        &self,
        name: &str,
        scheduler: Arc<TaskScheduler>,
        worker_pool_size: usize,
        failover_agent: Option<&str>,
    ) -> Result<()> {
        let mut crews = self.inner.crews.lock().await;
        if crews.contains_key(name) {
            return Err(Error::Validation(format!("crew {} already registered", name)));
        }
        crews.insert(
            name.to_string(),
            Crew {
                scheduler,
                failover_agent: failover_agent.map(str::to_string),
                metrics: CrewMetrics {
                    worker_pool_size,
                    ..CrewMetrics::default()
                },
                last_scaled: None,
            },
        );
        log_info!("Coordinator: added crew={} workers={}", name, worker_pool_size);
        Ok(())
    }

    /// Unregister a crew and hand back its scheduler.
    pub async fn remove_crew(&self, name: &str) -> Option<Arc<TaskScheduler>> {
        self.inner
            .crews
            .lock()
            .await
            .remove(name)
            .map(|c| c.scheduler)
    }

    pub async fn crews(&self) -> Vec<String> {
        self.inner.crews.lock().await.keys().cloned().collect()
    }

    pub async fn scheduler(&self, crew: &str) -> Result<Arc<TaskScheduler>> {
        let crews = self.inner.crews.lock().await;
        crews
            .get(crew)
            .map(|c| Arc::clone(&c.scheduler))
            .ok_or_else(|| Error::CrewNotFound(crew.to_string()))
    }

    pub async fn crew_metrics(&self, crew: &str) -> Result<CrewMetrics> {
        let crews = self.inner.crews.lock().await;
        crews
            .get(crew)
            .map(|c| c.metrics.clone())
            .ok_or_else(|| Error::CrewNotFound(crew.to_string()))
    }

    /// Resolve a conflict within a crew.
    ///
    /// For priority conflicts, parties that are task ids of the crew count
    /// with their current priority when the context gives none, and receive
    /// the converged priority afterwards.
    pub async fn handle_conflict(
        &self,
        crew: &str,
        conflict_type: ConflictType,
        parties: &[String],
        context: ConflictContext,
    ) -> Result<ConflictResolution> {
        let scheduler = self.scheduler(crew).await?;

        let mut context = context;
        if conflict_type == ConflictType::Priority {
            for party in parties {
                if context.priorities.iter().any(|(p, _)| p == party) {
                    continue;
                }
                if let Some(task) = scheduler.get_task(&TaskId::from(party.as_str())).await {
                    context
                        .priorities
                        .push((party.clone(), f64::from(task.priority.ordinal())));
                }
            }
        }

        let resolution = self
            .inner
            .resolver
            .resolve(conflict_type, parties, &context)?;

        if let Some(mean) = resolution.outcome.converged_priority() {
            let priority = TaskPriority::nearest(mean);
            for party in parties {
                match scheduler
                    .set_priority(&TaskId::from(party.as_str()), priority)
                    .await
                {
                    Ok(()) => log_debug!(
                        "Coordinator: crew={} task={} priority -> {}",
                        crew,
                        party,
                        priority
                    ),
                    Err(Error::TaskNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        {
            let mut crews = self.inner.crews.lock().await;
            if let Some(c) = crews.get_mut(crew) {
                c.metrics.conflicts_resolved += 1;
            }
        }
        self.inner.emit(CoordinatorEvent::ConflictResolved {
            crew: crew.to_string(),
            resolution: resolution.clone(),
        });
        Ok(resolution)
    }

    /// Run one coordination pass over every crew.
    pub async fn tick(&self) -> TickSummary {
        self.inner.tick().await
    }

    pub fn start(&self) -> Result<()> {
        let mut guard = self
            .loop_handle
            .lock()
            .map_err(|_| Error::Validation("coordinator loop handle poisoned".to_string()))?;
        if guard.is_some() {
            return Err(Error::AlreadyRunning("coordinator"));
        }
        let cancel = CancellationToken::new();
        let join = tokio::spawn(Arc::clone(&self.inner).run_loop(cancel.clone()));
        *guard = Some(LoopHandle { cancel, join });
        log_info!(
            "Coordinator: loop started (tick={:?}, auto_scaling={})",
            self.inner.config.tick_interval,
            self.inner.config.auto_scaling
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.loop_handle
            .lock()
            .map(|g| g.is_some())
            .unwrap_or(false)
    }

    /// Stop the coordinator loop. Crew schedulers keep running.
    pub async fn stop(&self) {
        let handle = match self.loop_handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Err(e) = handle.join.await {
                log_error!("Coordinator: loop ended abnormally: {}", e);
            }
            log_info!("Coordinator: loop stopped");
        }
    }

    /// Stop the coordinator loop, every crew scheduler and the failover
    /// manager.
    pub async fn shutdown(&self) {
        self.stop().await;
        let schedulers: Vec<Arc<TaskScheduler>> = {
            let crews = self.inner.crews.lock().await;
            crews.values().map(|c| Arc::clone(&c.scheduler)).collect()
        };
        for scheduler in schedulers {
            scheduler.stop().await;
        }
        if let Some(failover) = &self.inner.failover {
            failover.stop().await;
        }
        log_info!("Coordinator: shutdown complete");
    }
}

impl Inner {
    fn emit(&self, event: CoordinatorEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    async fn tick(&self) -> TickSummary {
        let names: Vec<String> = self.crews.lock().await.keys().cloned().collect();
        let mut summary = TickSummary::default();
        for name in names {
            match self.evaluate_crew(&name).await {
                Ok(()) => summary.evaluated += 1,
                // Removed since the tick began.
                Err(Error::CrewNotFound(_)) => {}
                Err(e) => {
                    summary.failed += 1;
                    log_error!("Coordinator: crew={} evaluation failed: {}", name, e);
                    self.emit(CoordinatorEvent::TickFailed {
                        crew: name,
                        error: e.to_string(),
                    });
                }
            }
        }
        summary
    }

    async fn evaluate_crew(&self, name: &str) -> Result<()> {
        let (scheduler, agent) = {
            let crews = self.crews.lock().await;
            let crew = crews
                .get(name)
                .ok_or_else(|| Error::CrewNotFound(name.to_string()))?;
            (Arc::clone(&crew.scheduler), crew.failover_agent.clone())
        };

        let stats = scheduler.stats().await;
        let degraded = match (&self.failover, &agent) {
            (Some(failover), Some(agent)) => {
                let status = failover.status(agent).await?;
                status
                    .degraded
                    .then(|| status.last_error.unwrap_or_default())
            }
            _ => None,
        };

        let scaled = {
            let mut crews = self.crews.lock().await;
            let crew = crews
                .get_mut(name)
                .ok_or_else(|| Error::CrewNotFound(name.to_string()))?;
            let m = &mut crew.metrics;
            m.tasks_completed = stats.completed;
            m.tasks_failed = stats.failed;
            m.total_execution_time = stats.total_execution_time;
            m.workload = stats.workload();
            m.resource_utilization =
                (m.workload as f64 / m.worker_pool_size.max(1) as f64).min(1.0);

            let cooled = crew
                .last_scaled
                .map_or(true, |t| t.elapsed() >= self.scaling.config().cooldown);
            if self.config.auto_scaling && cooled {
                match self.scaling.evaluate(&crew.metrics.scaling_input()) {
                    Some(decision) => {
                        let from = crew.metrics.worker_pool_size;
                        let to = self.scaling.target_workers(from, decision.action);
                        crew.metrics.scaling_events += 1;
                        crew.metrics.worker_pool_size = to;
                        crew.last_scaled = Some(Instant::now());
                        Some((decision, from, to))
                    }
                    None => None,
                }
            } else {
                None
            }
        };

        if let Some((decision, from, to)) = scaled {
            log_info!(
                "Coordinator: crew={} {} by {} policy, workers {} -> {} ({})",
                name,
                decision.action,
                decision.policy,
                from,
                to,
                decision.reason
            );
            self.metrics.emit(
                Metric::count(metrics::SCALING_EVENT)
                    .label("crew", name)
                    .label("action", decision.action)
                    .label("policy", decision.policy),
            );
            self.emit(CoordinatorEvent::ScalingRecommended {
                crew: name.to_string(),
                decision,
                from_workers: from,
                to_workers: to,
            });
        }

        if let (Some(error), Some(agent)) = (degraded, agent) {
            log_warn!("Coordinator: crew={} agent={} degraded: {}", name, agent, error);
            self.emit(CoordinatorEvent::FailoverDegraded {
                crew: name.to_string(),
                agent,
                error,
            });
        }
        Ok(())
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let inner = Arc::clone(&self);
                    let backoff = match tokio::spawn(async move { inner.tick().await }).await {
                        Ok(summary) => summary.failed > 0,
                        Err(e) => {
                            log_error!("Coordinator: tick panicked: {}", e);
                            true
                        }
                    };
                    if backoff {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(self.config.error_backoff) => {}
                        }
                    }
                }
            }
        }
    }
}
