//! Jobs, triggers, execution logs, and the per-node scan-claim-dispatch engine.

pub mod engine;
pub mod job;
pub mod log;
pub mod trigger;

pub use engine::{CycleReport, SchedulerEngine};
pub use job::{Job, JobKind, JobPayload, RouteStrategy, ShellType};
pub use log::{LogOutcome, LogResult, TriggerLog};
pub use trigger::{MisfirePolicy, Schedule, Trigger, TriggerStatus};
