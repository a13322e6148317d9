//! Liveness probes for agent instances.
//!
//! The failover manager calls a [`HealthProbe`] once per instance per
//! health-check cycle and wraps each call in its probe timeout. Probes only
//! report what they saw; status and circuit decisions are made by the
//! manager.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::Instant;

use crate::orchestration::failover::AgentInstance;
use crate::log_trace;

/// Outcome of a single probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub healthy: bool,
    pub response_time: Duration,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn healthy(response_time: Duration) -> Self {
        Self {
            healthy: true,
            response_time,
            error: None,
        }
    }

    pub fn unhealthy(response_time: Duration, error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            response_time,
            error: Some(error.into()),
        }
    }
}

/// Checks whether an instance is alive.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, instance: &AgentInstance) -> ProbeResult;
}

/// Healthy when a TCP connection to the instance endpoint succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn probe(&self, instance: &AgentInstance) -> ProbeResult {
        let Some(endpoint) = instance.endpoint.as_deref() else {
            return ProbeResult::unhealthy(Duration::ZERO, "instance has no endpoint");
        };
        let started = Instant::now();
        match TcpStream::connect(endpoint).await {
            Ok(_) => ProbeResult::healthy(started.elapsed()),
            Err(e) => ProbeResult::unhealthy(started.elapsed(), format!("connect {}: {}", endpoint, e)),
        }
    }
}

/// Runs a shell command; exit status 0 means healthy.
///
/// `CREWLINE_INSTANCE_ID`, `CREWLINE_AGENT` and `CREWLINE_ENDPOINT` are set
/// for the command.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    command: String,
}

impl CommandProbe {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl HealthProbe for CommandProbe {
    async fn probe(&self, instance: &AgentInstance) -> ProbeResult {
        let started = Instant::now();
        let status = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("CREWLINE_INSTANCE_ID", &instance.id)
            .env("CREWLINE_AGENT", &instance.agent)
            .env("CREWLINE_ENDPOINT", instance.endpoint.as_deref().unwrap_or(""))
            .kill_on_drop(true)
            .output()
            .await;
        let elapsed = started.elapsed();
        log_trace!("CommandProbe: instance={} took {:?}", instance.id, elapsed);

        match status {
            Ok(out) if out.status.success() => ProbeResult::healthy(elapsed),
            Ok(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
                ProbeResult::unhealthy(
                    elapsed,
                    if stderr.is_empty() {
                        format!("probe exited with {}", out.status)
                    } else {
                        stderr
                    },
                )
            }
            Err(e) => ProbeResult::unhealthy(elapsed, format!("failed to spawn probe: {}", e)),
        }
    }
}

/// Adapts a synchronous closure into a [`HealthProbe`].
pub struct FnProbe<F> {
    f: F,
}

impl<F> FnProbe<F>
where
    F: Fn(&AgentInstance) -> ProbeResult + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> HealthProbe for FnProbe<F>
where
    F: Fn(&AgentInstance) -> ProbeResult + Send + Sync,
{
    async fn probe(&self, instance: &AgentInstance) -> ProbeResult {
        (self.f)(instance)
    }
}
