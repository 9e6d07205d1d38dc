//! Job execution on the local node.
//!
//! # Components
//!
//! - [`JobExecutor`]: one implementation per job kind, looked up through the
//!   [`ExecutorRegistry`]
//! - [`ShellExecutor`]: writes the script to a per-job directory and runs it
//!   under the configured interpreter, with stdout/stderr captured to files
//! - [`ScriptExecutor`]: evaluates embedded scripts on a pool of engines
//! - [`DispatchPool`]: bounded worker pool fed by the scheduler engine
//!
//! # Execution Flow
//!
//! 1. The engine submits a claimed trigger as a [`Dispatch`]; a full queue
//!    hands it straight back
//! 2. A worker appends a `Running` log entry and resolves the executor
//! 3. The executor runs under the job's hard timeout
//! 4. The worker finalizes the log entry, updates the failure counter and
//!    releases the claim

pub mod executor;
pub mod pool;
pub mod script;
pub mod shell;

pub use executor::{
    ExecutionContext, ExecutionResult, ExecutionStatus, ExecutorRegistry, JobExecutor,
};
pub use pool::{Dispatch, DispatchPool, HeldClaims, PoolSettings, SubmitOutcome};
pub use script::{EnginePool, ScriptExecutor};
pub use shell::ShellExecutor;
