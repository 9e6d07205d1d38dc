use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scheduler::trigger::Trigger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogOutcome {
    Running,
    Success,
    Failure,
    Timeout,
    /// Late slot dropped by the `Ignore` misfire policy.
    Skipped,
}

impl LogOutcome {
    pub fn is_final(&self) -> bool {
        !matches!(self, LogOutcome::Running)
    }
}

impl std::fmt::Display for LogOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogOutcome::Running => write!(f, "running"),
            LogOutcome::Success => write!(f, "success"),
            LogOutcome::Failure => write!(f, "failure"),
            LogOutcome::Timeout => write!(f, "timeout"),
            LogOutcome::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for LogOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(LogOutcome::Running),
            "success" => Ok(LogOutcome::Success),
            "failure" => Ok(LogOutcome::Failure),
            "timeout" => Ok(LogOutcome::Timeout),
            "skipped" => Ok(LogOutcome::Skipped),
            other => Err(format!("unknown log outcome: {other}")),
        }
    }
}

/// One execution attempt of a trigger.
///
/// Appended in `Running` state at dispatch time and finalized exactly once;
/// a finalized entry is never modified again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerLog {
    pub id: Uuid,
    pub trigger_id: Uuid,
    pub job_id: Uuid,
    pub namespace: String,
    pub node_id: String,
    /// Slot this execution was planned for.
    pub fire_time: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub outcome: LogOutcome,
    pub misfire: bool,
    pub manual: bool,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
    /// Attempts repeated after the first one failed.
    pub retry_count: u32,
}

impl TriggerLog {
    pub fn running(
        trigger: &Trigger,
        node_id: &str,
        fire_time: DateTime<Utc>,
        misfire: bool,
        manual: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger_id: trigger.id,
            job_id: trigger.job_id,
            namespace: trigger.namespace.clone(),
            node_id: node_id.to_string(),
            fire_time,
            start_time: Utc::now(),
            end_time: None,
            outcome: LogOutcome::Running,
            misfire,
            manual,
            exit_code: None,
            output: None,
            error: None,
            retry_count: 0,
        }
    }

    /// Record of a misfired slot that was skipped instead of run.
    pub fn skipped(trigger: &Trigger, node_id: &str, fire_time: DateTime<Utc>) -> Self {
        let mut log = Self::running(trigger, node_id, fire_time, true, false);
        log.end_time = Some(log.start_time);
        log.outcome = LogOutcome::Skipped;
        log
    }

    pub fn is_final(&self) -> bool {
        self.outcome.is_final()
    }

    pub fn apply(&mut self, result: LogResult) {
        self.outcome = result.outcome;
        self.end_time = Some(result.end_time);
        self.exit_code = result.exit_code;
        self.output = result.output;
        self.error = result.error;
        self.retry_count = result.retry_count;
    }
}

/// Final state written onto a `Running` log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogResult {
    pub outcome: LogOutcome,
    pub end_time: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub retry_count: u32,
}

impl LogResult {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            outcome: LogOutcome::Failure,
            end_time: Utc::now(),
            exit_code: None,
            output: None,
            error: Some(error.into()),
            retry_count: 0,
        }
    }
}
