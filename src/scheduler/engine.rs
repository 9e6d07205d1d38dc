use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cluster::{Membership, NodeHeartbeat, OwnerState};
use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::scheduler::log::TriggerLog;
use crate::scheduler::trigger::{chrono_millis, MisfirePolicy, Trigger};
use crate::store::{ClusterRegistry, TriggerStore};
use crate::timer::{jittered, Timeout, TimingWheel};
use crate::worker::{Dispatch, DispatchPool, HeldClaims, SubmitOutcome};

/// Spread added to the regular scan delay so nodes started together drift apart.
const SCAN_JITTER: f64 = 0.1;

/// Counters for one scan cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Node was in standby; only the heartbeat ran.
    pub standby: bool,
    pub due: usize,
    pub claimed: usize,
    /// Lost the conditional update to another node.
    pub conflicts: usize,
    /// Held by a live node (possibly this one); not attempted.
    pub busy: usize,
    pub taken_over: usize,
    /// Excluded from this node by the job's route strategy.
    pub routed_away: usize,
    pub dispatched: usize,
    /// Claimed ahead of time and held on the timing wheel.
    pub parked: usize,
    pub misfires: usize,
    /// Late slots dropped by the `Ignore` policy.
    pub skipped: usize,
    pub rejected: usize,
    pub errors: usize,
}

enum Attempt {
    Busy,
    RoutedAway,
    Conflict,
    Failed,
    Claimed {
        takeover: bool,
        misfire: bool,
        placed: Placement,
    },
}

enum Placement {
    Dispatched,
    Parked,
    Skipped,
    Rejected,
}

impl CycleReport {
    fn record(&mut self, attempt: Attempt) {
        match attempt {
            Attempt::Busy => self.busy += 1,
            Attempt::RoutedAway => self.routed_away += 1,
            Attempt::Conflict => self.conflicts += 1,
            Attempt::Failed => self.errors += 1,
            Attempt::Claimed {
                takeover,
                misfire,
                placed,
            } => {
                self.claimed += 1;
                self.taken_over += usize::from(takeover);
                self.misfires += usize::from(misfire);
                match placed {
                    Placement::Dispatched => self.dispatched += 1,
                    Placement::Parked => self.parked += 1,
                    Placement::Skipped => self.skipped += 1,
                    Placement::Rejected => self.rejected += 1,
                }
            }
        }
    }
}

/// A claimed trigger waiting on the wheel for its fire time.
struct Parked {
    timeout: Timeout,
    dispatch: Dispatch,
}

/// Per-node scan-claim-dispatch loop.
///
/// Each cycle refreshes this node's heartbeat, lists live nodes, and races the
/// rest of the cluster for due triggers through the store's conditional
/// update. Cycles never overlap: the next one is only armed on the timing
/// wheel after the current one has finished claiming and submitting.
pub struct SchedulerEngine {
    node_id: String,
    config: SchedulerConfig,
    store: Arc<dyn TriggerStore>,
    registry: Arc<dyn ClusterRegistry>,
    pool: Arc<DispatchPool>,
    wheel: Arc<TimingWheel>,
    held: HeldClaims,
    heartbeat: NodeHeartbeat,
    membership: Mutex<Membership>,
    standby: AtomicBool,
    parked: Mutex<HashMap<Uuid, Parked>>,
    scan_tx: mpsc::Sender<()>,
    scan_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl SchedulerEngine {
    pub fn new(
        node_id: impl Into<String>,
        config: SchedulerConfig,
        store: Arc<dyn TriggerStore>,
        registry: Arc<dyn ClusterRegistry>,
        pool: Arc<DispatchPool>,
        wheel: Arc<TimingWheel>,
        held: HeldClaims,
    ) -> Self {
        let node_id = node_id.into();
        let (scan_tx, scan_rx) = mpsc::channel(1);
        Self {
            heartbeat: NodeHeartbeat::new(node_id.clone(), &config),
            membership: Mutex::new(Membership::new(node_id.clone(), config.stale_after())),
            standby: AtomicBool::new(config.standby),
            node_id,
            config,
            store,
            registry,
            pool,
            wheel,
            held,
            parked: Mutex::new(HashMap::new()),
            scan_tx,
            scan_rx: Mutex::new(Some(scan_rx)),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_standby(&self) -> bool {
        self.standby.load(Ordering::Acquire)
    }

    /// Standby nodes keep heartbeating but stop claiming.
    pub fn set_standby(&self, standby: bool) {
        self.standby.store(standby, Ordering::Release);
    }

    /// Live nodes seen by the last cycle.
    pub fn live_nodes(&self) -> Vec<NodeHeartbeat> {
        self.membership
            .lock()
            .live_nodes()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn parked_count(&self) -> usize {
        self.parked.lock().len()
    }

    /// Drive cycles until `cancel` fires.
    ///
    /// The first cycle runs immediately; afterwards one runs every heartbeat
    /// interval, or earlier when a trigger's next slot falls before that.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut scan_rx) = self.scan_rx.lock().take() else {
            tracing::error!(node_id = %self.node_id, "Scheduler engine loop already running");
            return;
        };

        let (sweep_tx, mut sweep_rx) = mpsc::channel::<()>(1);
        let mut sweep_timer = self.arm(&sweep_tx, self.config.log_sweep_interval());
        let mut scan_timer: Option<Timeout> = None;
        let _ = self.scan_tx.try_send(());

        tracing::info!(node_id = %self.node_id, namespace = %self.config.namespace, "Scheduler engine started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(()) = scan_rx.recv() => {
                    match self.run_cycle().await {
                        Ok(report) if report.claimed > 0 || report.errors > 0 => {
                            tracing::debug!(node_id = %self.node_id, ?report, "Scan cycle finished");
                        }
                        Ok(_) => {}
                        Err(e) if e.is_store_failure() => {
                            tracing::error!(node_id = %self.node_id, error = %e, "Scan cycle aborted, store unavailable");
                        }
                        Err(e) => {
                            tracing::error!(node_id = %self.node_id, error = %e, "Scan cycle failed");
                        }
                    }
                    if let Some(previous) = scan_timer.take() {
                        previous.cancel();
                    }
                    scan_timer = self.arm(
                        &self.scan_tx,
                        jittered(self.config.heartbeat_interval(), SCAN_JITTER),
                    );
                    if scan_timer.is_none() {
                        break;
                    }
                }
                Some(()) = sweep_rx.recv() => {
                    self.sweep_logs().await;
                    sweep_timer = self.arm(&sweep_tx, self.config.log_sweep_interval());
                }
            }
        }

        for timer in [scan_timer, sweep_timer].into_iter().flatten() {
            timer.cancel();
        }
        tracing::info!(node_id = %self.node_id, "Scheduler engine stopped");
    }

    /// Schedule a signal on `tx` after `delay`. `None` once the wheel is stopped.
    fn arm(&self, tx: &mpsc::Sender<()>, delay: Duration) -> Option<Timeout> {
        let tx = tx.clone();
        match self.wheel.new_timeout(
            move |_| {
                let _ = tx.try_send(());
            },
            delay,
        ) {
            Ok(timeout) => Some(timeout),
            Err(e) => {
                tracing::debug!(error = %e, "Could not arm engine timer");
                None
            }
        }
    }

    /// Ask for an extra cycle at `at` when it comes before the regular one.
    fn wake_at(&self, at: DateTime<Utc>) {
        let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if delay < self.config.heartbeat_interval() {
            self.arm(&self.scan_tx, delay);
        }
    }

    /// One scan cycle. Store failures abort the cycle; per-trigger failures are
    /// counted in the report and never abort it.
    pub async fn run_cycle(self: &Arc<Self>) -> Result<CycleReport> {
        let standby = self.is_standby();
        self.registry
            .heartbeat(&self.heartbeat.refreshed(standby))
            .await?;

        let mut report = CycleReport {
            standby,
            ..CycleReport::default()
        };
        if standby {
            return Ok(report);
        }

        let live = self
            .registry
            .list_live_nodes(&self.config.namespace, self.config.stale_after())
            .await?;
        self.membership.lock().update(live);

        let horizon = Utc::now() + chrono_millis(self.config.lookahead().as_millis() as u64);
        let due = self
            .store
            .find_due_triggers(&self.config.namespace, horizon)
            .await?;
        report.due = due.len();

        let attempts: Vec<Attempt> = stream::iter(due)
            .map(|trigger| self.attempt(trigger))
            .buffer_unordered(self.config.scheduler_executor_pool_size.max(1))
            .collect()
            .await;
        for attempt in attempts {
            report.record(attempt);
        }
        Ok(report)
    }

    async fn attempt(self: &Arc<Self>, trigger: Trigger) -> Attempt {
        let state = self.membership.lock().owner_state(trigger.owner.as_deref());
        let (expected_owner, takeover) = match state {
            OwnerState::Unclaimed => (None, false),
            OwnerState::Orphaned(owner) => {
                tracing::warn!(
                    trigger_id = %trigger.id,
                    previous_owner = %owner,
                    "Taking over orphaned trigger"
                );
                (Some(owner), true)
            }
            // Our id on the row but nothing held locally: a release that failed.
            OwnerState::Mine if !self.held.contains(trigger.id) => {
                tracing::warn!(trigger_id = %trigger.id, "Reclaiming leaked claim");
                (Some(self.node_id.clone()), false)
            }
            OwnerState::Mine | OwnerState::Live(_) => return Attempt::Busy,
        };

        let job = match self.store.get_job(trigger.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::debug!(trigger_id = %trigger.id, "Job removed before claim");
                return Attempt::Failed;
            }
            Err(e) => {
                tracing::error!(trigger_id = %trigger.id, error = %e, "Failed to load job");
                return Attempt::Failed;
            }
        };
        let routed_here = {
            let membership = self.membership.lock();
            job.route_strategy
                .allows(&self.config.instance_name, &membership.active_instances())
        };
        if !routed_here {
            tracing::debug!(
                trigger_id = %trigger.id,
                instance = %self.config.instance_name,
                route = ?job.route_strategy,
                "Trigger routed to other instances"
            );
            return Attempt::RoutedAway;
        }

        match self
            .store
            .claim(
                trigger.id,
                &self.node_id,
                expected_owner.as_deref(),
                trigger.version,
                self.config.stale_after(),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                let conflict = SchedulerError::ClaimConflict {
                    trigger_id: trigger.id,
                };
                tracing::debug!(node_id = %self.node_id, "{conflict}");
                return Attempt::Conflict;
            }
            Err(e) => {
                tracing::error!(trigger_id = %trigger.id, error = %e, "Claim attempt failed");
                return Attempt::Failed;
            }
        }
        self.held.insert(trigger.id);

        let trigger_id = trigger.id;
        let misfire = trigger.is_misfire(Utc::now(), self.config.misfire_threshold());
        match self.place(trigger, misfire).await {
            Ok(placed) => Attempt::Claimed {
                takeover,
                misfire,
                placed,
            },
            Err(e) => {
                tracing::error!(trigger_id = %trigger_id, error = %e, "Failed to plan claimed trigger");
                self.release(trigger_id).await;
                Attempt::Failed
            }
        }
    }

    /// Advance the claimed trigger's fire times, then run, park or skip it.
    async fn place(self: &Arc<Self>, trigger: Trigger, misfire: bool) -> Result<Placement> {
        let now = Utc::now();
        let Some(fire_time) = trigger.next_fire_time else {
            self.release(trigger.id).await;
            return Ok(Placement::Skipped);
        };

        // A manual fire moved next_fire_time off the grid; resume from the grid's anchor.
        let anchor = if trigger.manual_fire {
            trigger.start_time
        } else {
            fire_time
        };
        let next = trigger.following_fire_time(anchor, now)?;
        self.store
            .update_next_fire_time(trigger.id, next, Some(fire_time))
            .await?;
        if let Some(next) = next {
            self.wake_at(next);
        }

        if misfire {
            let late_by_ms = (now - fire_time).num_milliseconds();
            let event = SchedulerError::Misfire {
                trigger_id: trigger.id,
                late_by_ms,
            };
            tracing::warn!(policy = %trigger.misfire_policy, next_fire_time = ?next, "{event}");

            if trigger.misfire_policy == MisfirePolicy::Ignore {
                self.store
                    .append_log(&TriggerLog::skipped(&trigger, &self.node_id, fire_time))
                    .await?;
                self.release(trigger.id).await;
                return Ok(Placement::Skipped);
            }
        }

        let dispatch = Dispatch {
            manual: trigger.manual_fire,
            trigger,
            fire_time,
            misfire,
        };

        match (fire_time - now).to_std() {
            Ok(delay) if !delay.is_zero() => {
                self.park(dispatch, delay)?;
                Ok(Placement::Parked)
            }
            _ => Ok(self.submit(dispatch).await),
        }
    }

    /// Hold a claimed trigger on the wheel until its fire time.
    fn park(self: &Arc<Self>, dispatch: Dispatch, delay: Duration) -> Result<()> {
        let trigger_id = dispatch.trigger.id;
        let engine: Weak<Self> = Arc::downgrade(self);
        // Registered before arming so a short delay cannot fire ahead of the insert.
        let mut parked = self.parked.lock();
        let timeout = self.wheel.new_timeout(
            move |_| {
                if let Some(engine) = engine.upgrade() {
                    tokio::spawn(async move { engine.fire_parked(trigger_id).await });
                }
            },
            delay,
        )?;
        parked.insert(trigger_id, Parked { timeout, dispatch });
        tracing::debug!(trigger_id = %trigger_id, delay_ms = delay.as_millis() as u64, "Parked trigger until fire time");
        Ok(())
    }

    async fn fire_parked(self: Arc<Self>, trigger_id: Uuid) {
        let Some(parked) = self.parked.lock().remove(&trigger_id) else {
            return;
        };
        self.submit(parked.dispatch).await;
    }

    async fn submit(&self, dispatch: Dispatch) -> Placement {
        let trigger_id = dispatch.trigger.id;
        match self.pool.submit(dispatch) {
            SubmitOutcome::Accepted => {
                tracing::debug!(trigger_id = %trigger_id, "Dispatched trigger");
                Placement::Dispatched
            }
            SubmitOutcome::Rejected(dispatch) => {
                let exhausted = SchedulerError::PoolExhausted(format!(
                    "{} queued, {} in flight",
                    self.pool.queued(),
                    self.pool.in_flight()
                ));
                tracing::warn!(trigger_id = %trigger_id, "{exhausted}, releasing claim");
                self.restore(&dispatch).await;
                self.release(trigger_id).await;
                Placement::Rejected
            }
        }
    }

    /// Put back the fire times a rejected dispatch advanced, so the slot is
    /// retried instead of lost.
    async fn restore(&self, dispatch: &Dispatch) {
        let trigger = &dispatch.trigger;
        let restored = if dispatch.manual {
            self.store.request_fire(trigger.id, dispatch.fire_time).await
        } else {
            self.store
                .update_next_fire_time(trigger.id, Some(dispatch.fire_time), trigger.last_fire_time)
                .await
        };
        if let Err(e) = restored {
            tracing::warn!(trigger_id = %trigger.id, error = %e, "Failed to restore fire time");
        }
    }

    async fn release(&self, trigger_id: Uuid) {
        if let Err(e) = self.store.release(trigger_id, &self.node_id).await {
            tracing::warn!(trigger_id = %trigger_id, error = %e, "Failed to release claim");
        }
        self.held.remove(trigger_id);
    }

    /// Cancel every parked trigger, put its slot back and release its claim.
    pub async fn unpark_all(&self) -> usize {
        let parked: Vec<Parked> = self.parked.lock().drain().map(|(_, p)| p).collect();
        let mut released = 0;
        for Parked { timeout, dispatch } in parked {
            // An entry still in the map was never submitted, even if its
            // timeout already expired: `fire_parked` will find nothing.
            timeout.cancel();
            self.restore(&dispatch).await;
            self.release(dispatch.trigger.id).await;
            released += 1;
        }
        released
    }

    async fn sweep_logs(&self) {
        let cutoff = Utc::now() - chrono_millis(self.config.log_retention().as_millis() as u64);
        // Rows still running past retention were abandoned by a crashed node.
        let abandoned = SchedulerError::ExecutorFailure("abandoned by its node".into()).to_string();
        match self.store.fail_running_logs(None, cutoff, &abandoned).await {
            Ok(0) => {}
            Ok(expired) => tracing::warn!(expired, "Expired abandoned running trigger logs"),
            Err(e) => tracing::warn!(error = %e, "Failed to expire abandoned trigger logs"),
        }
        match self.store.purge_logs(cutoff).await {
            Ok(0) => {}
            Ok(purged) => tracing::info!(purged, "Purged expired trigger logs"),
            Err(e) => tracing::warn!(error = %e, "Log retention sweep failed"),
        }
    }
}

impl std::fmt::Debug for SchedulerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerEngine")
            .field("node_id", &self.node_id)
            .field("namespace", &self.config.namespace)
            .field("standby", &self.is_standby())
            .field("held", &self.held.len())
            .field("parked", &self.parked_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{Job, LogOutcome, RouteStrategy, Schedule, TriggerLog, TriggerStatus};
    use crate::store::MemoryStore;
    use crate::worker::{ExecutorRegistry, PoolSettings};

    struct Fixture {
        engine: Arc<SchedulerEngine>,
        store: MemoryStore,
        pool: Arc<DispatchPool>,
        wheel: Arc<TimingWheel>,
    }

    fn fixture(node_id: &str, workers: usize, queue: usize) -> Fixture {
        let config = SchedulerConfig::new("default", node_id)
            .with_heartbeat_interval(1_000)
            .with_pool(workers, queue);
        let store = MemoryStore::new();
        let held = HeldClaims::new();
        let registry = ExecutorRegistry::with_defaults(&config).unwrap();
        let pool = Arc::new(DispatchPool::new(
            node_id,
            Arc::new(store.clone()),
            registry,
            held.clone(),
            PoolSettings {
                workers,
                queue_size: queue,
                default_timeout: Duration::from_secs(5),
                max_consecutive_failures: 3,
            },
        ));
        let wheel = Arc::new(
            TimingWheel::new(
                Arc::new(tokio::runtime::Handle::current()),
                Duration::from_millis(5),
                64,
            )
            .unwrap(),
        );
        let engine = Arc::new(SchedulerEngine::new(
            node_id,
            config,
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            pool.clone(),
            wheel.clone(),
            held,
        ));
        Fixture {
            engine,
            store,
            pool,
            wheel,
        }
    }

    async fn overdue_trigger(store: &MemoryStore, late: Duration) -> Trigger {
        let job = Job::script("default", "j", "1 + 1");
        let mut trigger = Trigger::new(&job, "t", Schedule::every(Duration::from_secs(60))).unwrap();
        trigger.next_fire_time = Some(Utc::now() - chrono_millis(late.as_millis() as u64));
        store.insert_job(&job).await.unwrap();
        store.insert_trigger(&trigger).await.unwrap();
        trigger
    }

    #[tokio::test]
    async fn standby_cycle_only_heartbeats() {
        let f = fixture("a", 1, 1);
        overdue_trigger(&f.store, Duration::from_millis(10)).await;
        f.engine.set_standby(true);

        let report = f.engine.run_cycle().await.unwrap();
        assert!(report.standby);
        assert_eq!(report.claimed, 0);
        let nodes = f.store.list_nodes("default").await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].standby);
        f.wheel.stop();
    }

    #[tokio::test]
    async fn due_trigger_is_claimed_dispatched_and_advanced() {
        let f = fixture("a", 1, 1);
        let trigger = overdue_trigger(&f.store, Duration::from_millis(10)).await;

        let report = f.engine.run_cycle().await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.misfires, 0);

        assert!(f.pool.shutdown(Duration::from_secs(2)).await);
        let row = f.store.get_trigger(trigger.id).await.unwrap().unwrap();
        assert!(row.owner.is_none());
        assert!(row.next_fire_time.unwrap() > Utc::now());
        assert_eq!(row.last_fire_time, trigger.next_fire_time);

        let logs = f.store.list_logs(Some(trigger.id), 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].outcome, LogOutcome::Success);
        f.wheel.stop();
    }

    #[tokio::test]
    async fn ignore_policy_skips_late_slot() {
        let f = fixture("a", 1, 1);
        let job = Job::script("default", "j", "1");
        let mut trigger = Trigger::new(&job, "t", Schedule::every(Duration::from_secs(60)))
            .unwrap()
            .with_misfire(MisfirePolicy::Ignore, Some(Duration::from_millis(100)));
        trigger.next_fire_time = Some(Utc::now() - chrono::Duration::seconds(5));
        f.store.insert_job(&job).await.unwrap();
        f.store.insert_trigger(&trigger).await.unwrap();

        let report = f.engine.run_cycle().await.unwrap();
        assert_eq!(report.misfires, 1);
        assert_eq!(report.skipped, 1);

        let logs = f.store.list_logs(Some(trigger.id), 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].outcome, LogOutcome::Skipped);
        assert!(logs[0].misfire);
        let row = f.store.get_trigger(trigger.id).await.unwrap().unwrap();
        assert!(row.owner.is_none());
        f.wheel.stop();
    }

    #[tokio::test]
    async fn trigger_inside_lookahead_is_parked_then_fired() {
        let f = fixture("a", 1, 1);
        let job = Job::script("default", "j", "1");
        let mut trigger = Trigger::new(&job, "t", Schedule::every(Duration::from_secs(60))).unwrap();
        trigger.next_fire_time = Some(Utc::now() + chrono::Duration::milliseconds(200));
        f.store.insert_job(&job).await.unwrap();
        f.store.insert_trigger(&trigger).await.unwrap();

        let report = f.engine.run_cycle().await.unwrap();
        assert_eq!(report.parked, 1);
        assert_eq!(f.engine.parked_count(), 1);
        assert!(f.store.list_logs(Some(trigger.id), 10).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(f.engine.parked_count(), 0);
        let logs = f.store.list_logs(Some(trigger.id), 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].start_time >= trigger.next_fire_time.unwrap());
        f.wheel.stop();
    }

    #[tokio::test]
    async fn unpark_releases_claims() {
        let f = fixture("a", 1, 1);
        let job = Job::script("default", "j", "1");
        let mut trigger = Trigger::new(&job, "t", Schedule::every(Duration::from_secs(60))).unwrap();
        trigger.next_fire_time = Some(Utc::now() + chrono::Duration::milliseconds(800));
        f.store.insert_job(&job).await.unwrap();
        f.store.insert_trigger(&trigger).await.unwrap();

        f.engine.run_cycle().await.unwrap();
        assert_eq!(f.engine.unpark_all().await, 1);
        let row = f.store.get_trigger(trigger.id).await.unwrap().unwrap();
        assert!(row.owner.is_none());
        // The slot goes back to the store for the next node to pick up.
        assert_eq!(row.next_fire_time, trigger.next_fire_time);
        f.wheel.stop();
    }

    #[tokio::test]
    async fn unpark_restores_slot_whose_timeout_already_expired() {
        let f = fixture("a", 1, 1);
        let job = Job::script("default", "j", "1");
        let mut trigger = Trigger::new(&job, "t", Schedule::every(Duration::from_secs(60))).unwrap();
        trigger.next_fire_time = Some(Utc::now() + chrono::Duration::milliseconds(800));
        f.store.insert_job(&job).await.unwrap();
        f.store.insert_trigger(&trigger).await.unwrap();

        f.engine.run_cycle().await.unwrap();
        // The wheel already took the timeout, but the fire task has not yet
        // removed the entry from the map.
        assert!(f.engine.parked.lock().get(&trigger.id).unwrap().timeout.cancel());

        assert_eq!(f.engine.unpark_all().await, 1);
        let row = f.store.get_trigger(trigger.id).await.unwrap().unwrap();
        assert!(row.owner.is_none());
        assert_eq!(row.next_fire_time, trigger.next_fire_time);
        assert!(!f.engine.held.contains(trigger.id));
        f.wheel.stop();
    }

    #[tokio::test]
    async fn route_strategy_filters_before_claim() {
        let f = fixture("a", 1, 1);
        let job = Job::script("default", "j", "1")
            .with_route(RouteStrategy::Whitelist(vec!["b".into()]));
        let mut trigger = Trigger::new(&job, "t", Schedule::every(Duration::from_secs(60))).unwrap();
        trigger.next_fire_time = Some(Utc::now() - chrono::Duration::milliseconds(10));
        f.store.insert_job(&job).await.unwrap();
        f.store.insert_trigger(&trigger).await.unwrap();

        let report = f.engine.run_cycle().await.unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(report.routed_away, 1);
        assert_eq!(report.claimed, 0);
        let row = f.store.get_trigger(trigger.id).await.unwrap().unwrap();
        assert!(row.owner.is_none());
        assert_eq!(row.version, trigger.version);
        f.wheel.stop();
    }

    #[tokio::test]
    async fn preferred_route_falls_back_when_preferred_node_is_absent() {
        let f = fixture("a", 1, 1);
        let job = Job::script("default", "j", "1")
            .with_route(RouteStrategy::Preferred(vec!["b".into()]));
        let mut trigger = Trigger::new(&job, "t", Schedule::every(Duration::from_secs(60))).unwrap();
        trigger.next_fire_time = Some(Utc::now() - chrono::Duration::milliseconds(10));
        f.store.insert_job(&job).await.unwrap();
        f.store.insert_trigger(&trigger).await.unwrap();

        let report = f.engine.run_cycle().await.unwrap();
        assert_eq!(report.routed_away, 0);
        assert_eq!(report.claimed, 1);
        assert!(f.pool.shutdown(Duration::from_secs(2)).await);
        f.wheel.stop();
    }

    #[tokio::test]
    async fn sweep_expires_abandoned_running_entries() {
        let f = fixture("a", 1, 1);
        let trigger = overdue_trigger(&f.store, Duration::from_millis(10)).await;
        let mut stuck = TriggerLog::running(&trigger, "crashed", Utc::now(), false, false);
        stuck.start_time = Utc::now() - chrono::Duration::days(30);
        f.store.append_log(&stuck).await.unwrap();
        let fresh = TriggerLog::running(&trigger, "busy", Utc::now(), false, false);
        f.store.append_log(&fresh).await.unwrap();

        f.engine.sweep_logs().await;
        let logs = f.store.list_logs(Some(trigger.id), 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].id, fresh.id);
        assert_eq!(logs[0].outcome, LogOutcome::Running);
        f.wheel.stop();
    }

    #[tokio::test]
    async fn store_outage_aborts_cycle() {
        let f = fixture("a", 1, 1);
        f.store.set_available(false);
        let err = f.engine.run_cycle().await.unwrap_err();
        assert!(err.is_store_failure());
        f.wheel.stop();
    }

    #[tokio::test]
    async fn paused_trigger_is_not_claimed() {
        let f = fixture("a", 1, 1);
        let trigger = overdue_trigger(&f.store, Duration::from_millis(10)).await;
        f.store
            .set_trigger_status(trigger.id, TriggerStatus::Paused)
            .await
            .unwrap();
        let report = f.engine.run_cycle().await.unwrap();
        assert_eq!(report.due, 0);
        f.wheel.stop();
    }
}
