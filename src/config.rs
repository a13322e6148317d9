use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::log::LogSettings;
use crate::orchestration::{
    CoordinatorConfig, FailoverConfig, ScalingConfig, ScalingPolicy, SchedulerConfig,
    SelectionStrategy,
};
use crate::{log_debug, Error, Result};

/// On-disk configuration, one section per component.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub failover: FailoverSettings,
    #[serde(default)]
    pub coordinator: CoordinatorSettings,
    #[serde(default)]
    pub scaling: ScalingSettings,
    #[serde(default)]
    pub log: LogSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerSettings {
    pub max_concurrent: usize,
    pub tick_ms: u64,
    pub default_max_retries: u32,
    pub default_timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub poll_interval_ms: u64,
    pub dependency_ttl_secs: Option<u64>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            tick_ms: 100,
            default_max_retries: 3,
            default_timeout_secs: 300,
            backoff_base_ms: 1000,
            backoff_max_ms: 60_000,
            poll_interval_ms: 100,
            dependency_ttl_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FailoverSettings {
    pub failure_threshold: f64,
    pub min_samples: usize,
    pub cooldown_secs: u64,
    pub health_check_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub auto_recovery: bool,
    pub recovery_delay_secs: u64,
    pub max_failures: u32,
    pub degraded_response_ms: u64,
    pub strategy: SelectionStrategy,
    pub prefer_primary: bool,
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            min_samples: 1,
            cooldown_secs: 60,
            health_check_interval_secs: 30,
            probe_timeout_secs: 5,
            auto_recovery: true,
            recovery_delay_secs: 30,
            max_failures: 3,
            degraded_response_ms: 2000,
            strategy: SelectionStrategy::PriorityBased,
            prefer_primary: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoordinatorSettings {
    pub tick_secs: u64,
    pub error_backoff_secs: u64,
    pub auto_scaling: bool,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            tick_secs: 5,
            error_backoff_secs: 1,
            auto_scaling: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScalingSettings {
    pub policies: Vec<ScalingPolicy>,
    pub min_workers: usize,
    pub max_workers: usize,
    pub cooldown_secs: u64,
    pub business_start_hour: u32,
    pub business_end_hour: u32,
}

impl Default for ScalingSettings {
    fn default() -> Self {
        Self {
            policies: ScalingPolicy::DEFAULT_ORDER.to_vec(),
            min_workers: 1,
            max_workers: 10,
            cooldown_secs: 0,
            business_start_hour: 9,
            business_end_hour: 17,
        }
    }
}

impl Config {
    pub fn crewline_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".crewline"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::crewline_dir()?.join("crewline.toml"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from an explicit path. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        log_debug!("Config::load path={}", path.display());
        if !path.exists() {
            log_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        log_debug!(
            "Config loaded: max_concurrent={}, strategy={:?}, tick_secs={}",
            config.scheduler.max_concurrent,
            config.failover.strategy,
            config.coordinator.tick_secs
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        Self::ensure_dirs()?;
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        log_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs() -> Result<()> {
        let dir = Self::crewline_dir()?;
        if !dir.exists() {
            log_debug!("Creating crewline directory: {}", dir.display());
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_concurrent == 0 {
            return Err(Error::Validation(
                "scheduler.max_concurrent must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.failover.failure_threshold) {
            return Err(Error::Validation(
                "failover.failure_threshold must be within 0..=1".to_string(),
            ));
        }
        if self.scaling.min_workers > self.scaling.max_workers {
            return Err(Error::Validation(
                "scaling.min_workers exceeds scaling.max_workers".to_string(),
            ));
        }
        if self.scaling.business_start_hour >= self.scaling.business_end_hour
            || self.scaling.business_end_hour > 24
        {
            return Err(Error::Validation(
                "scaling business hours must satisfy start < end <= 24".to_string(),
            ));
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let s = &self.scheduler;
        SchedulerConfig {
            max_concurrent: s.max_concurrent,
            tick_interval: Duration::from_millis(s.tick_ms),
            default_max_retries: s.default_max_retries,
            default_timeout: Duration::from_secs(s.default_timeout_secs),
            backoff_base: Duration::from_millis(s.backoff_base_ms),
            backoff_max: Duration::from_millis(s.backoff_max_ms),
            poll_interval: Duration::from_millis(s.poll_interval_ms),
            dependency_ttl: s.dependency_ttl_secs.map(Duration::from_secs),
        }
    }

    pub fn failover_config(&self) -> FailoverConfig {
        let f = &self.failover;
        FailoverConfig {
            failure_threshold: f.failure_threshold,
            min_samples: f.min_samples,
            cooldown: Duration::from_secs(f.cooldown_secs),
            health_check_interval: Duration::from_secs(f.health_check_interval_secs),
            probe_timeout: Duration::from_secs(f.probe_timeout_secs),
            auto_recovery: f.auto_recovery,
            recovery_delay: Duration::from_secs(f.recovery_delay_secs),
            max_failures: f.max_failures,
            degraded_response: Duration::from_millis(f.degraded_response_ms),
            strategy: f.strategy,
            prefer_primary: f.prefer_primary,
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        let c = &self.coordinator;
        CoordinatorConfig {
            tick_interval: Duration::from_secs(c.tick_secs),
            error_backoff: Duration::from_secs(c.error_backoff_secs),
            auto_scaling: c.auto_scaling,
        }
    }

    pub fn scaling_config(&self) -> ScalingConfig {
        let s = &self.scaling;
        ScalingConfig {
            policies: s.policies.clone(),
            min_workers: s.min_workers,
            max_workers: s.max_workers,
            cooldown: Duration::from_secs(s.cooldown_secs),
            business_hours: s.business_start_hour..s.business_end_hour,
        }
    }
}
