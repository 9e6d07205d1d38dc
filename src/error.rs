use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Another node won the conditional update for this trigger.
    #[error("Claim conflict on trigger {trigger_id}")]
    ClaimConflict { trigger_id: Uuid },

    #[error("Trigger {trigger_id} misfired, late by {late_by_ms}ms")]
    Misfire { trigger_id: Uuid, late_by_ms: i64 },

    #[error("Job exceeded its timeout of {timeout_ms}ms")]
    ExecutorTimeout { timeout_ms: u64 },

    #[error("Job execution failed: {0}")]
    ExecutorFailure(String),

    #[error("Pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Trigger not found: {0}")]
    TriggerNotFound(Uuid),

    #[error("Cannot {op} while node is {from}")]
    InvalidState { from: String, op: &'static str },

    #[error("Timing wheel has been stopped")]
    TimerStopped,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SchedulerError {
    /// Errors that should abort the current scan cycle and be retried on the next tick.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            SchedulerError::StoreUnavailable(_) | SchedulerError::Database(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
