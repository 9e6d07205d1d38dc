use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::scheduler::{JobKind, JobPayload, LogOutcome, LogResult};
use crate::worker::script::ScriptExecutor;
use crate::worker::shell::ShellExecutor;

/// Identity of one execution, handed to the executor along with the payload.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub log_id: Uuid,
    pub job_id: Uuid,
    pub job_name: String,
    pub trigger_id: Uuid,
    pub node_id: String,
    pub fire_time: DateTime<Utc>,
    pub misfire: bool,
    pub manual: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Success,
    Failure,
    Timeout,
}

impl From<ExecutionStatus> for LogOutcome {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Success => LogOutcome::Success,
            ExecutionStatus::Failure => LogOutcome::Failure,
            ExecutionStatus::Timeout => LogOutcome::Timeout,
        }
    }
}

/// Result of job execution
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn success(output: Option<String>) -> Self {
        Self {
            status: ExecutionStatus::Success,
            exit_code: None,
            output,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failure,
            exit_code: None,
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn timeout(timeout: Duration) -> Self {
        Self::from_error(&SchedulerError::ExecutorTimeout {
            timeout_ms: timeout.as_millis() as u64,
        })
    }

    /// Result for a run that ended in an error instead of producing one.
    pub fn from_error(error: &SchedulerError) -> Self {
        let status = match error {
            SchedulerError::ExecutorTimeout { .. } => ExecutionStatus::Timeout,
            _ => ExecutionStatus::Failure,
        };
        Self {
            status,
            exit_code: None,
            output: None,
            error: Some(error.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn into_log_result(self) -> LogResult {
        LogResult {
            outcome: self.status.into(),
            end_time: Utc::now(),
            exit_code: self.exit_code,
            output: self.output,
            error: self.error,
            retry_count: 0,
        }
    }
}

/// Runs one kind of job payload.
///
/// Implementations enforce `timeout` themselves and must not panic on bad
/// input; every problem is reported through the returned result.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    fn kind(&self) -> JobKind;

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        payload: &JobPayload,
        timeout: Duration,
    ) -> ExecutionResult;
}

/// Executors keyed by the job kind they handle.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<JobKind, Arc<dyn JobExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in shell and script executors.
    pub fn with_defaults(config: &SchedulerConfig) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(ShellExecutor::new(config.shell.clone())));
        registry.register(Arc::new(ScriptExecutor::new(&config.script)?));
        Ok(registry)
    }

    /// Adds an executor, replacing any previous one for the same kind.
    pub fn register(&mut self, executor: Arc<dyn JobExecutor>) {
        self.executors.insert(executor.kind(), executor);
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobExecutor>> {
        self.executors.get(&kind).cloned()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("kinds", &self.executors.keys().collect::<Vec<_>>())
            .finish()
    }
}
