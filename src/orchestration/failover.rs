//! Agent instance pools with per-instance circuit breakers.
//!
//! Every logical agent name maps to a pool of interchangeable instances, one
//! of which is active at a time. A periodic health-check cycle probes every
//! instance not in maintenance, feeds the result into the instance's
//! circuit breaker, and fails the pool over to the best healthy alternative
//! when the active instance stops being healthy.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{Error, Result};
use crate::metrics::{self, Metric, SharedSink};
use crate::orchestration::health::{HealthProbe, ProbeResult};
use crate::util::with_timeout;
use crate::{log_debug, log_error, log_info, log_warn};

/// Size of the per-instance outcome ring buffer.
pub const WINDOW_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Failing,
    Failed,
    Recovering,
    Maintenance,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Failing => "failing",
            HealthStatus::Failed => "failed",
            HealthStatus::Recovering => "recovering",
            HealthStatus::Maintenance => "maintenance",
        };
        write!(f, "{}", s)
    }
}

/// How a replacement instance is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Lowest priority number wins.
    #[default]
    PriorityBased,
    /// Healthy instances by priority; otherwise fewest failures.
    HealthBased,
    /// Lowest in-flight to capacity ratio.
    LoadBased,
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionStrategy::PriorityBased => write!(f, "priority_based"),
            SelectionStrategy::HealthBased => write!(f, "health_based"),
            SelectionStrategy::LoadBased => write!(f, "load_based"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    ok: bool,
    response_time: Duration,
}

/// One interchangeable instance of a logical agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInstance {
    pub id: String,
    /// Logical agent name; the pool this instance belongs to.
    pub agent: String,
    /// Lower is preferred.
    pub priority: u32,
    pub endpoint: Option<String>,
    pub status: HealthStatus,
    pub circuit: CircuitState,
    /// Consecutive failed probes.
    pub failure_count: u32,
    pub is_primary: bool,
    pub is_active: bool,
    pub in_flight: usize,
    pub capacity: usize,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    #[serde(skip)]
    window: VecDeque<Sample>,
    #[serde(skip)]
    opened_at: Option<Instant>,
}

impl AgentInstance {
    pub fn new(id: &str, agent: &str, priority: u32) -> Self {
        Self {
            id: id.to_string(),
            agent: agent.to_string(),
            priority,
            endpoint: None,
            status: HealthStatus::Healthy,
            circuit: CircuitState::Closed,
            failure_count: 0,
            is_primary: false,
            is_active: false,
            in_flight: 0,
            capacity: 1,
            last_check: None,
            last_error: None,
            window: VecDeque::with_capacity(WINDOW_SIZE),
            opened_at: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = Some(endpoint.to_string());
        self
    }

    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Healthy with a closed circuit: eligible to receive traffic.
    pub fn is_available(&self) -> bool {
        self.status == HealthStatus::Healthy && self.circuit == CircuitState::Closed
    }

    /// Response times of the recorded probes, oldest first.
    pub fn response_times(&self) -> Vec<Duration> {
        self.window.iter().map(|s| s.response_time).collect()
    }

    pub fn average_response_time(&self) -> Option<Duration> {
        if self.window.is_empty() {
            return None;
        }
        let total: Duration = self.window.iter().map(|s| s.response_time).sum();
        Some(total / self.window.len() as u32)
    }

    /// Failed probes over recorded probes; 0 when nothing is recorded.
    pub fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|s| !s.ok).count();
        failures as f64 / self.window.len() as f64
    }

    pub fn load_ratio(&self) -> f64 {
        self.in_flight as f64 / self.capacity.max(1) as f64
    }

    fn set_circuit(&mut self, to: CircuitState) -> (CircuitState, CircuitState) {
        let from = self.circuit;
        self.circuit = to;
        (from, to)
    }

    fn open(&mut self, now: Instant) -> (CircuitState, CircuitState) {
        self.opened_at = Some(now);
        self.set_circuit(CircuitState::Open)
    }

    fn close(&mut self) -> (CircuitState, CircuitState) {
        self.opened_at = None;
        self.failure_count = 0;
        self.window.clear();
        self.set_circuit(CircuitState::Closed)
    }

    fn push_sample(&mut self, result: &ProbeResult) {
        if self.window.len() == WINDOW_SIZE {
            self.window.pop_front();
        }
        self.window.push_back(Sample {
            ok: result.healthy,
            response_time: result.response_time,
        });
    }

    /// Fold one probe result into the circuit and health status. Returns the
    /// circuit transitions taken.
    fn apply_probe(
        &mut self,
        result: &ProbeResult,
        config: &FailoverConfig,
        now: Instant,
    ) -> Vec<(CircuitState, CircuitState)> {
        let mut transitions = Vec::new();

        // Once the cool-down has passed, this probe is the half-open trial.
        if self.circuit == CircuitState::Open
            && self
                .opened_at
                .map_or(true, |t| now.duration_since(t) >= config.cooldown)
        {
            transitions.push(self.set_circuit(CircuitState::HalfOpen));
        }

        self.push_sample(result);
        self.last_check = Some(Utc::now());
        if result.healthy {
            self.failure_count = 0;
            self.last_error = None;
        } else {
            self.failure_count += 1;
            self.last_error = Some(
                result
                    .error
                    .clone()
                    .unwrap_or_else(|| "probe failed".to_string()),
            );
        }

        match self.circuit {
            CircuitState::Closed => {
                if !result.healthy
                    && self.window.len() >= config.min_samples.max(1)
                    && self.failure_rate() >= config.failure_threshold
                {
                    transitions.push(self.open(now));
                }
            }
            CircuitState::HalfOpen => {
                if result.healthy {
                    transitions.push(self.close());
                } else {
                    transitions.push(self.open(now));
                }
            }
            CircuitState::Open => {}
        }

        self.status = match (self.circuit, result.healthy) {
            (CircuitState::Open, _) => HealthStatus::Failed,
            (_, true) if result.response_time > config.degraded_response => HealthStatus::Degraded,
            (_, true) => HealthStatus::Healthy,
            (_, false) if self.failure_count >= config.max_failures => HealthStatus::Failed,
            (_, false) => HealthStatus::Failing,
        };
        transitions
    }
}

/// Choose among `candidates` by `strategy`. Ties go to the earlier candidate.
pub fn select_instance<'a>(
    strategy: SelectionStrategy,
    candidates: &[&'a AgentInstance],
) -> Option<&'a AgentInstance> {
    match strategy {
        SelectionStrategy::PriorityBased => candidates.iter().copied().min_by_key(|i| i.priority),
        SelectionStrategy::HealthBased => {
            let healthy = candidates
                .iter()
                .copied()
                .filter(|i| i.status == HealthStatus::Healthy)
                .min_by_key(|i| i.priority);
            healthy.or_else(|| {
                candidates
                    .iter()
                    .copied()
                    .min_by_key(|i| (i.failure_count, i.priority))
            })
        }
        SelectionStrategy::LoadBased => candidates.iter().copied().min_by(|a, b| {
            a.load_ratio()
                .total_cmp(&b.load_ratio())
                .then(a.priority.cmp(&b.priority))
        }),
    }
}

/// Immutable record of one switch of the active instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverEvent {
    pub agent: String,
    pub from: String,
    pub to: String,
    pub reason: String,
    pub strategy: SelectionStrategy,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot of one agent pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub agent: String,
    pub active: Option<String>,
    pub instances: Vec<AgentInstance>,
    /// The active instance is unhealthy and no alternative was available.
    pub degraded: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// Failure rate at or above which a closed circuit opens.
    pub failure_threshold: f64,
    /// Recorded probes required before the failure rate is trusted.
    pub min_samples: usize,
    /// Time an open circuit waits before its half-open trial.
    pub cooldown: Duration,
    pub health_check_interval: Duration,
    pub probe_timeout: Duration,
    pub auto_recovery: bool,
    pub recovery_delay: Duration,
    /// Consecutive failures after which a failing instance is marked failed.
    pub max_failures: u32,
    /// Successful probes slower than this mark the instance degraded.
    pub degraded_response: Duration,
    pub strategy: SelectionStrategy,
    /// Switch back to a healthy primary whenever it is not active.
    pub prefer_primary: bool,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            min_samples: 1,
            cooldown: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            auto_recovery: true,
            recovery_delay: Duration::from_secs(30),
            max_failures: 3,
            degraded_response: Duration::from_secs(2),
            strategy: SelectionStrategy::PriorityBased,
            prefer_primary: false,
        }
    }
}

impl FailoverConfig {
    pub fn with_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.failure_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_recovery(mut self, enabled: bool, delay: Duration) -> Self {
        self.auto_recovery = enabled;
        self.recovery_delay = delay;
        self
    }

    pub fn with_prefer_primary(mut self, prefer: bool) -> Self {
        self.prefer_primary = prefer;
        self
    }
}

#[derive(Debug, Default)]
struct Pool {
    instances: Vec<AgentInstance>,
    active: Option<String>,
    degraded: bool,
    last_error: Option<String>,
}

impl Pool {
    fn get(&self, id: &str) -> Option<&AgentInstance> {
        self.instances.iter().find(|i| i.id == id)
    }

    fn active_instance(&self) -> Option<&AgentInstance> {
        self.active.as_deref().and_then(|id| self.get(id))
    }

    fn set_active(&mut self, id: Option<String>) {
        for instance in &mut self.instances {
            instance.is_active = Some(&instance.id) == id.as_ref();
        }
        self.active = id;
    }

    /// Best available instance other than the active one.
    fn best_alternative(&self, strategy: SelectionStrategy) -> Option<String> {
        let candidates: Vec<&AgentInstance> = self
            .instances
            .iter()
            .filter(|i| i.is_available() && Some(&i.id) != self.active.as_ref())
            .collect();
        select_instance(strategy, &candidates).map(|i| i.id.clone())
    }

    fn switch_to(
        &mut self,
        agent: &str,
        to: String,
        reason: String,
        strategy: SelectionStrategy,
    ) -> FailoverEvent {
        let from = self.active.clone().unwrap_or_default();
        self.set_active(Some(to.clone()));
        self.degraded = false;
        self.last_error = None;
        FailoverEvent {
            agent: agent.to_string(),
            from,
            to,
            reason,
            strategy,
            timestamp: Utc::now(),
        }
    }

    fn snapshot(&self, agent: &str) -> PoolStatus {
        PoolStatus {
            agent: agent.to_string(),
            active: self.active.clone(),
            instances: self.instances.clone(),
            degraded: self.degraded,
            last_error: self.last_error.clone(),
        }
    }
}

#[derive(Default)]
struct FailoverState {
    pools: BTreeMap<String, Pool>,
    history: Vec<FailoverEvent>,
}

impl FailoverState {
    fn find_mut(&mut self, id: &str) -> Option<&mut AgentInstance> {
        self.pools
            .values_mut()
            .flat_map(|p| p.instances.iter_mut())
            .find(|i| i.id == id)
    }

    fn find(&self, id: &str) -> Option<&AgentInstance> {
        self.pools
            .values()
            .flat_map(|p| p.instances.iter())
            .find(|i| i.id == id)
    }
}

struct Inner {
    config: FailoverConfig,
    probe: Arc<dyn HealthProbe>,
    metrics: SharedSink,
    state: Mutex<FailoverState>,
    /// Held for a whole health-check cycle.
    cycle: Mutex<()>,
    recoveries: TaskTracker,
    recovery_cancel: std::sync::Mutex<CancellationToken>,
}

struct LoopHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Owns the agent pools and runs the health-check loop.
pub struct FailoverManager {
    inner: Arc<Inner>,
    loop_handle: std::sync::Mutex<Option<LoopHandle>>,
}

impl FailoverManager {
    pub fn new(probe: Arc<dyn HealthProbe>, config: FailoverConfig) -> Self {
        Self::with_metrics(probe, config, metrics::default_sink())
    }

    pub fn with_metrics(
        probe: Arc<dyn HealthProbe>,
        config: FailoverConfig,
        metrics: SharedSink,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                probe,
                metrics,
                state: Mutex::new(FailoverState::default()),
                cycle: Mutex::new(()),
                recoveries: TaskTracker::new(),
                recovery_cancel: std::sync::Mutex::new(CancellationToken::new()),
            }),
            loop_handle: std::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &FailoverConfig {
        &self.inner.config
    }

    /// Add an instance to its agent's pool. Returns `false` if the id is
    /// already registered.
    ///
    /// The first instance of a pool becomes active. Flagging an instance
    /// primary clears the flag on the rest of its pool.
    pub async fn add_instance(&self, mut instance: AgentInstance) -> bool {
        let mut state = self.inner.state.lock().await;
        if state.find(&instance.id).is_some() {
            return false;
        }
        let agent = instance.agent.clone();
        let id = instance.id.clone();
        let pool = state.pools.entry(agent.clone()).or_default();
        if instance.is_primary {
            for other in &mut pool.instances {
                other.is_primary = false;
            }
        }
        instance.is_active = false;
        pool.instances.push(instance);
        if pool.active.is_none() {
            pool.set_active(Some(id.clone()));
        }
        log_info!("Failover: added instance={} to agent={}", id, agent);
        true
    }

    /// Remove an instance. If it was active, the best available instance
    /// takes over, or the lowest-priority-number remaining one if none is
    /// available.
    pub async fn remove_instance(&self, id: &str) -> bool {
        let strategy = self.inner.config.strategy;
        let mut state = self.inner.state.lock().await;
        let Some(agent) = state.find(id).map(|i| i.agent.clone()) else {
            return false;
        };
        let mut event = None;
        if let Some(pool) = state.pools.get_mut(&agent) {
            let was_active = pool.active.as_deref() == Some(id);
            pool.instances.retain(|i| i.id != id);
            if pool.instances.is_empty() {
                state.pools.remove(&agent);
            } else if was_active {
                pool.active = None;
                let next = pool.best_alternative(strategy).or_else(|| {
                    pool.instances
                        .iter()
                        .min_by_key(|i| i.priority)
                        .map(|i| i.id.clone())
                });
                if let Some(next) = next {
                    let mut e = pool.switch_to(&agent, next, format!("instance {} removed", id), strategy);
                    e.from = id.to_string();
                    event = Some(e);
                }
            }
        }
        if let Some(event) = event {
            state.history.push(event.clone());
            drop(state);
            self.inner.record_failover(&event);
        }
        log_info!("Failover: removed instance={}", id);
        true
    }

    pub async fn get_instance(&self, id: &str) -> Option<AgentInstance> {
        self.inner.state.lock().await.find(id).cloned()
    }

    pub async fn instances(&self, agent: &str) -> Vec<AgentInstance> {
        let state = self.inner.state.lock().await;
        state
            .pools
            .get(agent)
            .map(|p| p.instances.clone())
            .unwrap_or_default()
    }

    pub async fn active_instance(&self, agent: &str) -> Option<AgentInstance> {
        let state = self.inner.state.lock().await;
        state
            .pools
            .get(agent)
            .and_then(|p| p.active_instance())
            .cloned()
    }

    pub async fn agents(&self) -> Vec<String> {
        self.inner.state.lock().await.pools.keys().cloned().collect()
    }

    pub async fn status(&self, agent: &str) -> Result<PoolStatus> {
        let state = self.inner.state.lock().await;
        state
            .pools
            .get(agent)
            .map(|p| p.snapshot(agent))
            .ok_or_else(|| Error::AgentNotFound(agent.to_string()))
    }

    pub async fn failover_history(&self) -> Vec<FailoverEvent> {
        self.inner.state.lock().await.history.clone()
    }

    /// Record the load figures used by `load_based` selection.
    pub async fn set_load(&self, id: &str, in_flight: usize, capacity: usize) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let instance = state
            .find_mut(id)
            .ok_or_else(|| Error::InstanceNotFound(id.to_string()))?;
        instance.in_flight = in_flight;
        instance.capacity = capacity;
        Ok(())
    }

    /// Put an instance into or out of maintenance.
    ///
    /// Instances in maintenance are neither probed nor selected; putting the
    /// active one into maintenance fails its pool over right away. Leaving
    /// maintenance resets the circuit and marks the instance recovering.
    pub async fn set_maintenance(&self, id: &str, maintenance: bool) -> Result<()> {
        let events = {
            let mut state = self.inner.state.lock().await;
            let instance = state
                .find_mut(id)
                .ok_or_else(|| Error::InstanceNotFound(id.to_string()))?;
            if maintenance {
                instance.status = HealthStatus::Maintenance;
            } else if instance.status == HealthStatus::Maintenance {
                instance.close();
                instance.status = HealthStatus::Recovering;
            }
            log_info!("Failover: instance={} maintenance={}", id, maintenance);
            self.inner.evaluate_pools(&mut state)
        };
        self.inner.publish(events);
        Ok(())
    }

    /// Switch an agent's active instance now, using the configured strategy.
    pub async fn force_failover(&self, agent: &str, reason: &str) -> Result<FailoverEvent> {
        let strategy = self.inner.config.strategy;
        let event = {
            let mut state = self.inner.state.lock().await;
            let pool = state
                .pools
                .get_mut(agent)
                .ok_or_else(|| Error::AgentNotFound(agent.to_string()))?;
            let Some(next) = pool.best_alternative(strategy) else {
                let err = Error::NoHealthyAlternative {
                    agent: agent.to_string(),
                };
                pool.last_error = Some(err.to_string());
                return Err(err);
            };
            let event = pool.switch_to(agent, next, reason.to_string(), strategy);
            state.history.push(event.clone());
            event
        };
        self.inner.record_failover(&event);
        Ok(event)
    }

    /// Run one health-check cycle. Returns the failovers it caused.
    pub async fn run_health_check(&self) -> Vec<FailoverEvent> {
        Arc::clone(&self.inner).health_cycle().await
    }

    /// Start the periodic health-check loop.
    pub fn start(&self) -> Result<()> {
        let mut guard = self
            .loop_handle
            .lock()
            .map_err(|_| Error::Validation("failover loop handle poisoned".to_string()))?;
        if guard.is_some() {
            return Err(Error::AlreadyRunning("failover manager"));
        }
        let cancel = CancellationToken::new();
        let join = tokio::spawn(Arc::clone(&self.inner).run_loop(cancel.clone()));
        *guard = Some(LoopHandle { cancel, join });
        log_info!(
            "Failover: health loop started (interval={:?}, strategy={})",
            self.inner.config.health_check_interval,
            self.inner.config.strategy
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.loop_handle
            .lock()
            .map(|g| g.is_some())
            .unwrap_or(false)
    }

    /// Stop the health loop and cancel pending recovery probes.
    pub async fn stop(&self) {
        let handle = match self.loop_handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Err(e) = handle.join.await {
                log_error!("Failover: health loop ended abnormally: {}", e);
            }
        }

        let token = match self.inner.recovery_cancel.lock() {
            Ok(mut token) => std::mem::replace(&mut *token, CancellationToken::new()),
            Err(_) => return,
        };
        token.cancel();
        self.inner.recoveries.close();
        self.inner.recoveries.wait().await;
        self.inner.recoveries.reopen();
        log_info!("Failover: stopped");
    }
}

impl Inner {
    async fn probe_one(&self, instance: &AgentInstance) -> ProbeResult {
        let timeout = self.config.probe_timeout;
        match with_timeout(timeout, self.probe.probe(instance)).await {
            Ok(result) => result,
            Err(e) => ProbeResult::unhealthy(timeout, e.to_string()),
        }
    }

    async fn health_cycle(self: Arc<Self>) -> Vec<FailoverEvent> {
        let _cycle = self.cycle.lock().await;

        let targets: Vec<AgentInstance> = {
            let state = self.state.lock().await;
            state
                .pools
                .values()
                .flat_map(|p| p.instances.iter())
                .filter(|i| i.status != HealthStatus::Maintenance)
                .cloned()
                .collect()
        };

        let results = join_all(targets.iter().map(|t| self.probe_one(t))).await;

        let now = Instant::now();
        let (transitions, events) = {
            let mut state = self.state.lock().await;
            let mut transitions = Vec::new();
            for (target, result) in targets.iter().zip(results.iter()) {
                // Removed or put into maintenance while probing.
                let Some(instance) = state.find_mut(&target.id) else {
                    continue;
                };
                if instance.status == HealthStatus::Maintenance {
                    continue;
                }
                for (from, to) in instance.apply_probe(result, &self.config, now) {
                    transitions.push((instance.id.clone(), from, to));
                }
            }
            let events = self.evaluate_pools(&mut state);
            (transitions, events)
        };

        for (id, from, to) in transitions {
            log_info!("Failover: instance={} circuit {} -> {}", id, from, to);
            self.metrics.emit(
                Metric::count(metrics::CIRCUIT_TRANSITION)
                    .label("instance", &id)
                    .label("from", from)
                    .label("to", to),
            );
        }

        let switched = self.publish(events);
        if self.config.auto_recovery {
            for event in &switched {
                if !event.from.is_empty() {
                    self.schedule_recovery(event.from.clone());
                }
            }
        }
        switched
    }

    /// Check every pool's active instance and fail over where needed.
    /// Returns new events plus the agents whose failover was deferred.
    fn evaluate_pools(&self, state: &mut FailoverState) -> PoolEvaluation {
        let strategy = self.config.strategy;
        let mut evaluation = PoolEvaluation::default();

        for (agent, pool) in state.pools.iter_mut() {
            let active = pool.active_instance().map(|a| (a.id.clone(), a.is_available(), a.status));
            match active {
                Some((_, true, _)) => {
                    pool.degraded = false;
                    pool.last_error = None;
                    if !self.config.prefer_primary {
                        continue;
                    }
                    let primary = pool
                        .instances
                        .iter()
                        .find(|i| i.is_primary && !i.is_active && i.is_available())
                        .map(|i| i.id.clone());
                    if let Some(primary) = primary {
                        evaluation.events.push(pool.switch_to(
                            agent,
                            primary,
                            "primary restored".to_string(),
                            strategy,
                        ));
                    }
                }
                other => {
                    let reason = match &other {
                        Some((id, _, status)) => format!("active instance {} is {}", id, status),
                        None => "no active instance".to_string(),
                    };
                    match pool.best_alternative(strategy) {
                        Some(next) => {
                            evaluation
                                .events
                                .push(pool.switch_to(agent, next, reason, strategy));
                        }
                        None => {
                            let err = Error::NoHealthyAlternative {
                                agent: agent.clone(),
                            };
                            pool.degraded = true;
                            pool.last_error = Some(err.to_string());
                            evaluation.deferred.push((agent.clone(), reason));
                        }
                    }
                }
            }
        }

        state.history.extend(evaluation.events.iter().cloned());
        evaluation
    }

    /// Log and count the outcome of an evaluation. Returns the failovers.
    fn publish(&self, evaluation: PoolEvaluation) -> Vec<FailoverEvent> {
        for (agent, reason) in &evaluation.deferred {
            log_warn!(
                "Failover: agent={} needs failover ({}) but has no healthy alternative, deferring",
                agent,
                reason
            );
            self.metrics
                .emit(Metric::count(metrics::FAILOVER_DEFERRED).label("agent", agent));
        }
        for event in &evaluation.events {
            self.record_failover(event);
        }
        evaluation.events
    }

    fn record_failover(&self, event: &FailoverEvent) {
        log_info!(
            "Failover: agent={} {} -> {} ({}, {})",
            event.agent,
            event.from,
            event.to,
            event.reason,
            event.strategy
        );
        self.metrics.emit(
            Metric::count(metrics::FAILOVER_EVENT)
                .label("agent", &event.agent)
                .label("from", &event.from)
                .label("to", &event.to),
        );
    }

    fn schedule_recovery(self: &Arc<Self>, id: String) {
        let cancel = match self.recovery_cancel.lock() {
            Ok(token) => token.clone(),
            Err(_) => return,
        };
        let inner = Arc::clone(self);
        log_debug!(
            "Failover: recovery probe for instance={} in {:?}",
            id,
            self.config.recovery_delay
        );
        self.recoveries.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(inner.config.recovery_delay) => {
                    inner.recover(&id).await;
                }
            }
        });
    }

    /// Probe a failed-over instance; on success close its circuit and mark
    /// it recovering. It does not become active by recovering.
    async fn recover(&self, id: &str) {
        let _cycle = self.cycle.lock().await;
        let target = {
            let state = self.state.lock().await;
            match state.find(id) {
                Some(i)
                    if !i.is_active
                        && !matches!(i.status, HealthStatus::Healthy | HealthStatus::Maintenance) =>
                {
                    i.clone()
                }
                _ => return,
            }
        };

        let result = self.probe_one(&target).await;
        if !result.healthy {
            log_warn!(
                "Failover: recovery probe for instance={} failed: {}",
                id,
                result.error.as_deref().unwrap_or("unknown")
            );
            return;
        }

        let transition = {
            let mut state = self.state.lock().await;
            let Some(instance) = state.find_mut(id) else {
                return;
            };
            if instance.status == HealthStatus::Maintenance {
                return;
            }
            let (from, to) = instance.close();
            instance.status = HealthStatus::Recovering;
            (from != to).then_some((from, to))
        };
        log_info!("Failover: instance={} recovering", id);
        if let Some((from, to)) = transition {
            self.metrics.emit(
                Metric::count(metrics::CIRCUIT_TRANSITION)
                    .label("instance", id)
                    .label("from", from)
                    .label("to", to),
            );
        }
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.health_check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let cycle = tokio::spawn(Arc::clone(&self).health_cycle());
                    if let Err(e) = cycle.await {
                        log_error!("Failover: health check cycle failed: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

#[derive(Default)]
struct PoolEvaluation {
    events: Vec<FailoverEvent>,
    deferred: Vec<(String, String)>,
}
