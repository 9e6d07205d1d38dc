use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, SchedulerError};

/// Configuration for shell-process job execution.
///
/// Every shell job gets its own directory under `working_dir`; the script
/// file and per-execution stdout/stderr logs are written there.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Root directory for script files and execution logs
    pub working_dir: PathBuf,
    /// Upper bound on stdout bytes returned as execution output
    pub max_captured_output: usize,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            working_dir: std::env::temp_dir().join("clustercron").join("shell_job"),
            max_captured_output: 64 * 1024,
        }
    }
}

/// Configuration for the pooled script-engine executor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// Number of engine instances kept in the pool
    pub pool_size: usize,
    /// How long a checkout waits for a free engine before failing
    pub checkout_timeout_ms: u64,
    /// Operation budget per evaluation (0 = unlimited)
    pub max_operations: u64,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            checkout_timeout_ms: 5_000,
            max_operations: 0,
        }
    }
}

/// Per-node scheduler configuration.
///
/// Field names follow the recognized option set (`namespace`, `instanceName`,
/// `heartbeatInterval`, ...) in snake_case. Every field has a default, so a
/// TOML file only needs to name the options it overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub namespace: String,
    pub instance_name: String,
    pub standby: bool,
    pub heartbeat_interval_ms: u64,
    /// Heartbeat age after which a node counts as dead. Defaults to 3x heartbeat.
    pub stale_after_ms: Option<u64>,
    /// How far past `now` a scan looks for due triggers. Defaults to the heartbeat interval.
    pub lookahead_ms: Option<u64>,
    pub scheduler_executor_pool_size: usize,
    pub job_executor_pool_size: usize,
    pub job_executor_queue_size: usize,
    pub load_weight: f64,
    pub log_retention_ms: u64,
    pub log_sweep_interval_ms: u64,
    pub misfire_threshold_ms: u64,
    /// Consecutive failures before a trigger is paused. 0 disables auto-pause.
    pub max_consecutive_failures: u32,
    pub default_job_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub wheel_tick_ms: u64,
    pub wheel_size: usize,
    pub shell: ShellConfig,
    pub script: ScriptConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            namespace: "default".to_string(),
            instance_name: format!("node-{}", &suffix[..8]),
            standby: false,
            heartbeat_interval_ms: 1_000,
            stale_after_ms: None,
            lookahead_ms: None,
            scheduler_executor_pool_size: 4,
            job_executor_pool_size: 8,
            job_executor_queue_size: 64,
            load_weight: 1.0,
            log_retention_ms: 7 * 24 * 60 * 60 * 1_000,
            log_sweep_interval_ms: 60_000,
            misfire_threshold_ms: 5_000,
            max_consecutive_failures: 3,
            default_job_timeout_ms: 600_000,
            shutdown_timeout_ms: 10_000,
            wheel_tick_ms: 10,
            wheel_size: 512,
            shell: ShellConfig::default(),
            script: ScriptConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn new(namespace: impl Into<String>, instance_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            instance_name: instance_name.into(),
            ..Default::default()
        }
    }

    pub fn with_heartbeat_interval(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn with_standby(mut self, standby: bool) -> Self {
        self.standby = standby;
        self
    }

    pub fn with_pool(mut self, pool_size: usize, queue_size: usize) -> Self {
        self.job_executor_pool_size = pool_size;
        self.job_executor_queue_size = queue_size;
        self
    }

    /// Load a TOML file. Missing keys fall back to defaults.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: SchedulerConfig = toml::from_str(&raw)
            .map_err(|e| SchedulerError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(SchedulerError::Config("namespace must not be empty".into()));
        }
        if self.instance_name.trim().is_empty() {
            return Err(SchedulerError::Config(
                "instance_name must not be empty".into(),
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(SchedulerError::Config(
                "heartbeat_interval_ms must be > 0".into(),
            ));
        }
        if self.stale_after() <= self.heartbeat_interval() {
            return Err(SchedulerError::Config(
                "stale_after_ms must exceed heartbeat_interval_ms".into(),
            ));
        }
        if self.scheduler_executor_pool_size == 0 || self.job_executor_pool_size == 0 {
            return Err(SchedulerError::Config("pool sizes must be > 0".into()));
        }
        if self.job_executor_queue_size < self.job_executor_pool_size {
            return Err(SchedulerError::Config(format!(
                "job_executor_queue_size ({}) must be >= job_executor_pool_size ({})",
                self.job_executor_queue_size, self.job_executor_pool_size
            )));
        }
        if !(self.load_weight.is_finite() && self.load_weight > 0.0) {
            return Err(SchedulerError::Config("load_weight must be > 0".into()));
        }
        if self.wheel_tick_ms == 0 || self.wheel_size == 0 {
            return Err(SchedulerError::Config(
                "wheel_tick_ms and wheel_size must be > 0".into(),
            ));
        }
        if self.script.pool_size == 0 {
            return Err(SchedulerError::Config("script.pool_size must be > 0".into()));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(
            self.stale_after_ms
                .unwrap_or(self.heartbeat_interval_ms.saturating_mul(3)),
        )
    }

    pub fn lookahead(&self) -> Duration {
        Duration::from_millis(self.lookahead_ms.unwrap_or(self.heartbeat_interval_ms))
    }

    pub fn misfire_threshold(&self) -> Duration {
        Duration::from_millis(self.misfire_threshold_ms)
    }

    pub fn default_job_timeout(&self) -> Duration {
        Duration::from_millis(self.default_job_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn log_retention(&self) -> Duration {
        Duration::from_millis(self.log_retention_ms)
    }

    pub fn log_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.log_sweep_interval_ms)
    }

    pub fn wheel_tick(&self) -> Duration {
        Duration::from_millis(self.wheel_tick_ms)
    }
}
