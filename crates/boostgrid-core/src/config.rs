//! boostgrid.toml configuration.
//!
//! Durations are stored as integer milliseconds so the file stays flat;
//! accessors hand out `Duration`s.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Invalid configuration values.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("min_pool_size ({min}) exceeds max_pool_size ({max})")]
    PoolBounds { min: usize, max: usize },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("threshold {name} = {value} is outside [0, 1]")]
    Threshold { name: &'static str, value: f64 },

    #[error("scale_down_threshold ({down}) must be below scale_up_threshold ({up})")]
    ThresholdOrder { down: f64, up: f64 },

    #[error("backoff_multiplier ({0}) must be at least 1")]
    Multiplier(f64),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostConfig {
    pub coordinator: CoordinatorConfig,
    pub pool: PoolConfig,
    pub recovery: RecoveryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Cap on simultaneously active executions.
    pub max_concurrent_tasks: usize,
    /// Executions older than this are evicted by the stuck-task sweep.
    pub task_timeout_ms: u64,
    pub monitoring_interval_ms: u64,
    pub stuck_sweep_interval_ms: u64,
    /// Routing retries after the first failed attempt.
    pub max_routing_retries: u32,
    /// Wait between acquisition attempts while a request is queued.
    pub acquire_backoff_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 50,
            task_timeout_ms: 300_000,
            monitoring_interval_ms: 30_000,
            stuck_sweep_interval_ms: 30_000,
            max_routing_retries: 3,
            acquire_backoff_ms: 5_000,
        }
    }
}

impl CoordinatorConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_millis(self.monitoring_interval_ms)
    }

    pub fn stuck_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.stuck_sweep_interval_ms)
    }

    pub fn acquire_backoff(&self) -> Duration {
        Duration::from_millis(self.acquire_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub health_check_interval_ms: u64,
    /// Minimum gap between any two scaling actions.
    pub scaling_cooldown_ms: u64,
    /// Busy instances untouched for longer than this are treated as zombies.
    pub instance_timeout_ms: u64,
    /// Idle time before a non-essential instance may be scaled down.
    pub idle_timeout_ms: u64,
    /// Default per-instance concurrency when the driver does not report one.
    pub instance_max_concurrent_tasks: u32,
    pub persist_interval_ms: u64,
    /// Time-to-live of the persisted pool snapshot.
    pub state_ttl_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_pool_size: 2,
            max_pool_size: 20,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            health_check_interval_ms: 30_000,
            scaling_cooldown_ms: 60_000,
            instance_timeout_ms: 300_000,
            idle_timeout_ms: 300_000,
            instance_max_concurrent_tasks: 1,
            persist_interval_ms: 30_000,
            state_ttl_ms: 300_000,
        }
    }
}

impl PoolConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn scaling_cooldown(&self) -> Duration {
        Duration::from_millis(self.scaling_cooldown_ms)
    }

    pub fn instance_timeout(&self) -> Duration {
        Duration::from_millis(self.instance_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }

    pub fn state_ttl(&self) -> Duration {
        Duration::from_millis(self.state_ttl_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_retry_delay_ms: u64,
    /// Same-instance, same-type errors inside the pattern window that force fallback.
    pub panic_threshold: u32,
    pub pattern_window_ms: u64,
    /// Error records kept in memory and in the persisted list.
    pub history_limit: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_retry_delay_ms: 30_000,
            panic_threshold: 5,
            pattern_window_ms: 300_000,
            history_limit: 1_000,
        }
    }
}

impl RecoveryConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn pattern_window(&self) -> Duration {
        Duration::from_millis(self.pattern_window_ms)
    }
}

impl BoostConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    /// Parse and validate a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let config: BoostConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let pool = &self.pool;
        if pool.max_pool_size == 0 {
            return Err(ConfigError::Zero("max_pool_size"));
        }
        if pool.min_pool_size > pool.max_pool_size {
            return Err(ConfigError::PoolBounds {
                min: pool.min_pool_size,
                max: pool.max_pool_size,
            });
        }
        if pool.instance_max_concurrent_tasks == 0 {
            return Err(ConfigError::Zero("instance_max_concurrent_tasks"));
        }
        for (name, value) in [
            ("scale_up_threshold", pool.scale_up_threshold),
            ("scale_down_threshold", pool.scale_down_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Threshold { name, value });
            }
        }
        if pool.scale_down_threshold >= pool.scale_up_threshold {
            return Err(ConfigError::ThresholdOrder {
                down: pool.scale_down_threshold,
                up: pool.scale_up_threshold,
            });
        }
        if self.coordinator.max_concurrent_tasks == 0 {
            return Err(ConfigError::Zero("max_concurrent_tasks"));
        }
        if self.recovery.backoff_multiplier < 1.0 {
            return Err(ConfigError::Multiplier(self.recovery.backoff_multiplier));
        }
        Ok(())
    }
}
