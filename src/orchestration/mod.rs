//! Orchestration layer: task scheduling, agent failover, conflict
//! resolution, scaling advice and the coordinator loop that ties them
//! together.

mod coordinator;
mod executor;
mod failover;
mod health;
mod resolver;
mod scaling;
mod scheduler;

pub use coordinator::{
    Coordinator, CoordinatorBuilder, CoordinatorConfig, CoordinatorEvent, CrewMetrics,
    TickSummary,
};
pub use executor::{
    CommandExecutor, ExecutionError, Executor, FnExecutor, TaskInput, COMMAND_METADATA_KEY,
};
pub use failover::{
    select_instance, AgentInstance, CircuitState, FailoverConfig, FailoverEvent,
    FailoverManager, HealthStatus, PoolStatus, SelectionStrategy, WINDOW_SIZE,
};
pub use health::{CommandProbe, FnProbe, HealthProbe, ProbeResult, TcpProbe};
pub use resolver::{
    decide, ConflictContext, ConflictOutcome, ConflictResolution, ConflictResolver,
    ConflictType, StrategyDecision, ABSTAIN,
};
pub use scaling::{
    ScalingAction, ScalingConfig, ScalingDecision, ScalingManager, ScalingMetrics,
    ScalingPolicy,
};
pub use scheduler::{
    CompletionCallback, SchedulerBuilder, SchedulerConfig, SchedulerEvent, SchedulerStats,
    TaskScheduler, DEFAULT_TICK,
};
