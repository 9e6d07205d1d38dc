//! Persistence contracts consumed by the scheduler.
//!
//! The store is the source of truth and the single point of mutual exclusion:
//! `claim` is a compare-and-set on a trigger row (owner + version), and that
//! conditional update is the only cross-node synchronization primitive.
//!
//! Two implementations ship with the crate:
//! - [`MemoryStore`]: in-process, shareable between simulated nodes, with an
//!   availability switch for fault-injection tests
//! - [`SqliteStore`]: durable, WAL-mode SQLite shared by processes on one host

pub mod memory;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::cluster::NodeHeartbeat;
use crate::error::Result;
use crate::scheduler::{Job, LogResult, Trigger, TriggerLog, TriggerStatus};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Durable table of jobs, triggers and execution logs.
#[async_trait]
pub trait TriggerStore: Send + Sync {
    /// Cheap connectivity check, used at node startup.
    async fn ping(&self) -> Result<()>;

    async fn insert_job(&self, job: &Job) -> Result<()>;
    async fn update_job(&self, job: &Job) -> Result<()>;
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;
    async fn list_jobs(&self, namespace: &str) -> Result<Vec<Job>>;
    async fn set_job_enabled(&self, id: Uuid, enabled: bool) -> Result<()>;
    /// Deletes the job together with its triggers. Logs are kept.
    async fn delete_job(&self, id: Uuid) -> Result<()>;
    /// Bump the job's run counter; returns the new value.
    async fn increment_run_count(&self, id: Uuid) -> Result<u64>;

    async fn insert_trigger(&self, trigger: &Trigger) -> Result<()>;
    async fn get_trigger(&self, id: Uuid) -> Result<Option<Trigger>>;
    async fn list_triggers(&self, namespace: &str) -> Result<Vec<Trigger>>;

    /// `Normal` triggers of enabled jobs with `next_fire_time <= before`,
    /// earliest first.
    async fn find_due_triggers(&self, namespace: &str, before: DateTime<Utc>)
        -> Result<Vec<Trigger>>;

    /// Atomically set the owner to `node_id` if the row still has
    /// `expected_owner` and `expected_version`. Returns whether this call won.
    ///
    /// The owner being replaced must be unset, `node_id` itself, or a node
    /// whose last heartbeat is older than `stale_after`. Liveness is checked
    /// inside the same atomic update, so an owner that heartbeats after the
    /// caller's membership snapshot keeps its claim.
    async fn claim(
        &self,
        trigger_id: Uuid,
        node_id: &str,
        expected_owner: Option<&str>,
        expected_version: u64,
        stale_after: Duration,
    ) -> Result<bool>;

    /// Clear the owner if `node_id` still holds the claim.
    async fn release(&self, trigger_id: Uuid, node_id: &str) -> Result<bool>;

    /// Clear every claim held by `node_id`. Returns how many were released.
    async fn release_all(&self, node_id: &str) -> Result<usize>;

    /// Persist the fire times as given and clear any manual fire request.
    async fn update_next_fire_time(
        &self,
        trigger_id: Uuid,
        next: Option<DateTime<Utc>>,
        last_fire: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn set_trigger_status(&self, trigger_id: Uuid, status: TriggerStatus) -> Result<()>;

    /// Mark a trigger for an out-of-schedule fire at `at`.
    async fn request_fire(&self, trigger_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Reset or bump the consecutive failure counter; returns the new value.
    async fn record_outcome(&self, trigger_id: Uuid, success: bool) -> Result<u32>;

    async fn append_log(&self, entry: &TriggerLog) -> Result<Uuid>;

    /// Finalize a `Running` entry. Already-finalized entries are left untouched.
    async fn finalize_log(&self, log_id: Uuid, result: &LogResult) -> Result<()>;

    /// Most recent first, at most `limit` entries.
    async fn list_logs(&self, trigger_id: Option<Uuid>, limit: usize) -> Result<Vec<TriggerLog>>;

    /// Finalize `Running` entries that started before `started_before` as
    /// failures with `error`, only those written by `node_id` when given.
    /// Returns how many were finalized.
    async fn fail_running_logs(
        &self,
        node_id: Option<&str>,
        started_before: DateTime<Utc>,
        error: &str,
    ) -> Result<usize>;

    /// Delete finalized entries that started before `before`.
    async fn purge_logs(&self, before: DateTime<Utc>) -> Result<usize>;
}

/// Durable heartbeat table.
#[async_trait]
pub trait ClusterRegistry: Send + Sync {
    /// Upsert the node's row.
    async fn heartbeat(&self, node: &NodeHeartbeat) -> Result<()>;

    /// Nodes in `namespace` whose last heartbeat is younger than `stale_after`.
    async fn list_live_nodes(
        &self,
        namespace: &str,
        stale_after: Duration,
    ) -> Result<Vec<NodeHeartbeat>>;

    async fn list_nodes(&self, namespace: &str) -> Result<Vec<NodeHeartbeat>>;
    async fn list_namespaces(&self) -> Result<Vec<String>>;
    async fn remove_node(&self, node_id: &str) -> Result<()>;
}

/// `now - stale_after`, used as the liveness cut-off by both stores.
pub(crate) fn liveness_cutoff(stale_after: Duration) -> DateTime<Utc> {
    Utc::now() - crate::scheduler::trigger::chrono_millis(stale_after.as_millis() as u64)
}
