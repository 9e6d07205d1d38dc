use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::scheduler::{Job, Trigger, TriggerLog, TriggerStatus};
use crate::store::TriggerStore;
use crate::worker::executor::{ExecutionContext, ExecutionResult, ExecutorRegistry};

/// Extra time granted past a job's own timeout before the worker stops
/// waiting on a misbehaving executor.
const EXECUTOR_GRACE: Duration = Duration::from_millis(500);

/// A claimed trigger ready to run.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub trigger: Trigger,
    /// Slot this execution was planned for.
    pub fire_time: DateTime<Utc>,
    pub misfire: bool,
    pub manual: bool,
}

#[derive(Debug)]
pub enum SubmitOutcome {
    Accepted,
    /// Pool full or shut down; the caller still holds the claim.
    Rejected(Box<Dispatch>),
}

/// Trigger ids this node holds a claim on, from claim until release.
#[derive(Debug, Clone, Default)]
pub struct HeldClaims {
    inner: Arc<Mutex<HashSet<Uuid>>>,
}

impl HeldClaims {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, trigger_id: Uuid) {
        self.inner.lock().insert(trigger_id);
    }

    pub fn remove(&self, trigger_id: Uuid) {
        self.inner.lock().remove(&trigger_id);
    }

    pub fn contains(&self, trigger_id: Uuid) -> bool {
        self.inner.lock().contains(&trigger_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub workers: usize,
    pub queue_size: usize,
    pub default_timeout: Duration,
    /// 0 disables auto-pause.
    pub max_consecutive_failures: u32,
}

struct Shared {
    node_id: String,
    store: Arc<dyn TriggerStore>,
    registry: ExecutorRegistry,
    held: HeldClaims,
    settings: PoolSettings,
    in_flight: AtomicUsize,
}

/// Bounded job-execution pool.
///
/// `queue_size` dispatches may wait while `workers` run. Submission never
/// blocks: when the queue is full the dispatch comes back to the caller, which
/// releases the claim so the slot can be retried.
pub struct DispatchPool {
    tx: Mutex<Option<mpsc::Sender<Dispatch>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl DispatchPool {
    /// Spawns the workers on the current tokio runtime.
    pub fn new(
        node_id: impl Into<String>,
        store: Arc<dyn TriggerStore>,
        registry: ExecutorRegistry,
        held: HeldClaims,
        settings: PoolSettings,
    ) -> Self {
        let (tx, rx) = mpsc::channel(settings.queue_size.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let shared = Arc::new(Shared {
            node_id: node_id.into(),
            store,
            registry,
            held,
            in_flight: AtomicUsize::new(0),
            settings,
        });

        let workers = (0..shared.settings.workers.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(dispatch) = next else { break };
                        shared.in_flight.fetch_add(1, Ordering::AcqRel);
                        run_dispatch(&shared, dispatch).await;
                        shared.in_flight.fetch_sub(1, Ordering::AcqRel);
                    }
                    tracing::debug!(worker, "Dispatch worker exiting");
                })
            })
            .collect();

        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            shared,
        }
    }

    pub fn submit(&self, dispatch: Dispatch) -> SubmitOutcome {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return SubmitOutcome::Rejected(Box::new(dispatch));
        };
        match tx.try_send(dispatch) {
            Ok(()) => SubmitOutcome::Accepted,
            Err(mpsc::error::TrySendError::Full(d)) | Err(mpsc::error::TrySendError::Closed(d)) => {
                SubmitOutcome::Rejected(Box::new(d))
            }
        }
    }

    /// Dispatches waiting for a worker.
    pub fn queued(&self) -> usize {
        self.tx
            .lock()
            .as_ref()
            .map_or(0, |tx| tx.max_capacity() - tx.capacity())
    }

    /// Dispatches currently executing.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Stop accepting work and wait for queued and running dispatches.
    ///
    /// Returns `false` if `timeout` elapsed first; remaining workers are then
    /// aborted, their `Running` log entries are finalized as failures and
    /// their claims are left for the caller to release.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        drop(self.tx.lock().take());
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        let aborts: Vec<_> = workers.iter().map(|w| w.abort_handle()).collect();

        let drained = tokio::time::timeout(timeout, futures::future::join_all(workers))
            .await
            .is_ok();
        if !drained {
            tracing::warn!(
                in_flight = self.in_flight(),
                "Dispatch pool did not drain in time, aborting workers"
            );
            for abort in aborts {
                abort.abort();
            }
            let reason = SchedulerError::ExecutorFailure("aborted at shutdown".into()).to_string();
            match self
                .shared
                .store
                .fail_running_logs(Some(&self.shared.node_id), Utc::now(), &reason)
                .await
            {
                Ok(0) => {}
                Ok(count) => tracing::warn!(count, "Finalized aborted dispatches as failed"),
                Err(e) => tracing::warn!(error = %e, "Failed to finalize aborted dispatches"),
            }
        }
        drained
    }
}

async fn run_dispatch(shared: &Shared, dispatch: Dispatch) {
    let trigger_id = dispatch.trigger.id;
    if let Err(e) = execute_dispatch(shared, &dispatch).await {
        tracing::error!(trigger_id = %trigger_id, error = %e, "Dispatch bookkeeping failed");
    }

    match shared.store.release(trigger_id, &shared.node_id).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!(trigger_id = %trigger_id, "Claim was taken over before release")
        }
        Err(e) => {
            tracing::warn!(trigger_id = %trigger_id, error = %e, "Failed to release claim")
        }
    }
    shared.held.remove(trigger_id);
}

async fn execute_dispatch(shared: &Shared, dispatch: &Dispatch) -> Result<()> {
    let trigger = &dispatch.trigger;
    let log = TriggerLog::running(
        trigger,
        &shared.node_id,
        dispatch.fire_time,
        dispatch.misfire,
        dispatch.manual,
    );
    let log_id = shared.store.append_log(&log).await?;

    let job = shared.store.get_job(trigger.job_id).await?;
    let (result, retries) = match &job {
        None => (
            ExecutionResult::failure(format!("job {} no longer exists", trigger.job_id)),
            0,
        ),
        Some(job) => {
            let mut retries = 0;
            loop {
                let result = run_once(shared, dispatch, job, log_id).await;
                if result.is_success() || retries >= job.max_retry_count {
                    break (result, retries);
                }
                retries += 1;
                tracing::warn!(
                    trigger_id = %trigger.id,
                    log_id = %log_id,
                    retry = retries,
                    max_retries = job.max_retry_count,
                    error = result.error.as_deref().unwrap_or(""),
                    "Dispatch failed, retrying"
                );
            }
        }
    };

    let success = result.is_success();
    tracing::info!(
        trigger_id = %trigger.id,
        log_id = %log_id,
        status = ?result.status,
        retries,
        "Dispatch finished"
    );
    let mut log_result = result.into_log_result();
    log_result.retry_count = retries;
    shared.store.finalize_log(log_id, &log_result).await?;
    if let Some(job) = &job {
        if let Err(e) = shared.store.increment_run_count(job.id).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to bump run count");
        }
    }

    let failures = shared.store.record_outcome(trigger.id, success).await?;
    let max = shared.settings.max_consecutive_failures;
    if !success && max > 0 && failures >= max {
        tracing::warn!(
            trigger_id = %trigger.id,
            failures,
            "Pausing trigger after consecutive failures"
        );
        shared
            .store
            .set_trigger_status(trigger.id, TriggerStatus::Paused)
            .await?;
    }
    Ok(())
}

/// One attempt at the job, bounded by its timeout plus the grace period.
async fn run_once(shared: &Shared, dispatch: &Dispatch, job: &Job, log_id: Uuid) -> ExecutionResult {
    let Some(executor) = shared.registry.get(job.kind()) else {
        return ExecutionResult::failure(format!("no executor registered for {}", job.kind()));
    };
    let ctx = ExecutionContext {
        log_id,
        job_id: job.id,
        job_name: job.name.clone(),
        trigger_id: dispatch.trigger.id,
        node_id: shared.node_id.clone(),
        fire_time: dispatch.fire_time,
        misfire: dispatch.misfire,
        manual: dispatch.manual,
    };
    let timeout = job.timeout(shared.settings.default_timeout);
    let run = AssertUnwindSafe(executor.execute(&ctx, &job.payload, timeout)).catch_unwind();
    match tokio::time::timeout(timeout + EXECUTOR_GRACE, run).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => ExecutionResult::from_error(&SchedulerError::ExecutorFailure(
            "executor panicked".into(),
        )),
        Err(_) => ExecutionResult::timeout(timeout),
    }
}
