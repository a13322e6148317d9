//! Advisory scaling recommendations.
//!
//! Policies are consulted in a fixed order and the first one with an
//! opinion wins. Nothing here changes capacity; the coordinator decides
//! what to do with a recommendation.

use std::fmt;
use std::ops::Range;
use std::time::Duration;

use chrono::{Local, Timelike};
use serde::{Deserialize, Serialize};

use crate::log_debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingPolicy {
    Performance,
    Workload,
    Resource,
    TimeBased,
}

impl ScalingPolicy {
    pub const DEFAULT_ORDER: [ScalingPolicy; 4] = [
        ScalingPolicy::Performance,
        ScalingPolicy::Workload,
        ScalingPolicy::Resource,
        ScalingPolicy::TimeBased,
    ];
}

impl fmt::Display for ScalingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalingPolicy::Performance => write!(f, "performance"),
            ScalingPolicy::Workload => write!(f, "workload"),
            ScalingPolicy::Resource => write!(f, "resource"),
            ScalingPolicy::TimeBased => write!(f, "time_based"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
}

impl fmt::Display for ScalingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalingAction::ScaleUp => write!(f, "scale_up"),
            ScalingAction::ScaleDown => write!(f, "scale_down"),
        }
    }
}

/// Inputs to a scaling evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScalingMetrics {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub total_execution_time: Duration,
    /// In-flight plus queued tasks.
    pub workload: usize,
    pub resource_utilization: f64,
}

impl ScalingMetrics {
    /// completed / (completed + failed), 0 without samples.
    pub fn success_rate(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            0.0
        } else {
            self.tasks_completed as f64 / total as f64
        }
    }

    /// Completed tasks per second of execution time, 0 without samples.
    pub fn throughput(&self) -> f64 {
        let secs = self.total_execution_time.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.tasks_completed as f64 / secs
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub action: ScalingAction,
    pub policy: ScalingPolicy,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScalingConfig {
    /// Consulted in this order.
    pub policies: Vec<ScalingPolicy>,
    pub min_workers: usize,
    pub max_workers: usize,
    /// Minimum time between two applied scaling events of one crew.
    pub cooldown: Duration,
    /// Local hours, `start..end`.
    pub business_hours: Range<u32>,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            policies: ScalingPolicy::DEFAULT_ORDER.to_vec(),
            min_workers: 1,
            max_workers: 10,
            cooldown: Duration::ZERO,
            business_hours: 9..17,
        }
    }
}

impl ScalingConfig {
    pub fn with_policies(mut self, policies: Vec<ScalingPolicy>) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_worker_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max.max(min);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScalingManager {
    config: ScalingConfig,
}

impl ScalingManager {
    pub fn new(config: ScalingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScalingConfig {
        &self.config
    }

    /// Evaluate against the current local hour.
    pub fn evaluate(&self, metrics: &ScalingMetrics) -> Option<ScalingDecision> {
        self.evaluate_at(metrics, Local::now().hour())
    }

    /// Evaluate with an explicit local hour (0..24).
    pub fn evaluate_at(&self, metrics: &ScalingMetrics, hour: u32) -> Option<ScalingDecision> {
        let decision = self.config.policies.iter().find_map(|&policy| {
            let (action, reason) = match policy {
                ScalingPolicy::Performance => performance(metrics),
                ScalingPolicy::Workload => workload(metrics),
                ScalingPolicy::Resource => resource(metrics),
                ScalingPolicy::TimeBased => {
                    time_based(metrics, self.config.business_hours.contains(&hour))
                }
            }?;
            Some(ScalingDecision {
                action,
                policy,
                reason,
            })
        });
        if let Some(d) = &decision {
            log_debug!("Scaling: {} by {} ({})", d.action, d.policy, d.reason);
        }
        decision
    }

    /// Worker count after applying `action` to `current`, clamped to the
    /// configured bounds.
    pub fn target_workers(&self, current: usize, action: ScalingAction) -> usize {
        let target = match action {
            ScalingAction::ScaleUp => current.saturating_add(1),
            ScalingAction::ScaleDown => current.saturating_sub(1),
        };
        target.clamp(self.config.min_workers, self.config.max_workers)
    }
}

type Verdict = Option<(ScalingAction, String)>;

fn performance(m: &ScalingMetrics) -> Verdict {
    let success = m.success_rate();
    let throughput = m.throughput();
    if success < 0.7 || throughput < 0.1 {
        Some((
            ScalingAction::ScaleUp,
            format!("success rate {:.2}, throughput {:.2}/s", success, throughput),
        ))
    } else if success > 0.95 && throughput > 1.0 && m.workload < 3 {
        Some((
            ScalingAction::ScaleDown,
            format!(
                "success rate {:.2}, throughput {:.2}/s, workload {}",
                success, throughput, m.workload
            ),
        ))
    } else {
        None
    }
}

fn workload(m: &ScalingMetrics) -> Verdict {
    if m.workload > 10 {
        Some((ScalingAction::ScaleUp, format!("workload {}", m.workload)))
    } else if m.workload < 2 && m.tasks_completed > 10 {
        Some((
            ScalingAction::ScaleDown,
            format!("workload {} after {} tasks", m.workload, m.tasks_completed),
        ))
    } else {
        None
    }
}

fn resource(m: &ScalingMetrics) -> Verdict {
    let u = m.resource_utilization;
    if u > 0.9 {
        Some((ScalingAction::ScaleUp, format!("utilization {:.2}", u)))
    } else if u < 0.3 && m.workload < 3 {
        Some((
            ScalingAction::ScaleDown,
            format!("utilization {:.2}, workload {}", u, m.workload),
        ))
    } else {
        None
    }
}

fn time_based(m: &ScalingMetrics, business_hours: bool) -> Verdict {
    if business_hours && m.workload > 5 {
        Some((
            ScalingAction::ScaleUp,
            format!("business hours, workload {}", m.workload),
        ))
    } else if !business_hours && m.workload < 2 {
        Some((
            ScalingAction::ScaleDown,
            format!("off hours, workload {}", m.workload),
        ))
    } else {
        None
    }
}
