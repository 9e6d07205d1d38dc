use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cluster::NodeHeartbeat;
use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::scheduler::{Job, SchedulerEngine, Trigger, TriggerLog, TriggerStatus};
use crate::store::{ClusterRegistry, TriggerStore};
use crate::timer::TimingWheel;
use crate::worker::{DispatchPool, ExecutorRegistry, HeldClaims, JobExecutor, PoolSettings};

/// Lifecycle of a scheduler node.
///
/// `Stopped -> Starting -> Standby <-> Active -> Stopping -> Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Stopped,
    Starting,
    /// Heartbeating, not claiming.
    Standby,
    /// Running the scan-claim-dispatch loop.
    Active,
    Stopping,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeState::Stopped => "stopped",
            NodeState::Starting => "starting",
            NodeState::Standby => "standby",
            NodeState::Active => "active",
            NodeState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Components that only exist between `start` and `stop`.
struct Running {
    node_id: String,
    engine: Arc<SchedulerEngine>,
    pool: Arc<DispatchPool>,
    wheel: Arc<TimingWheel>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// One scheduler instance: identity, pools and engine behind an explicit
/// start/stop lifecycle.
///
/// Every run gets a fresh node id (`<instance_name>@<suffix>`), so a
/// restarted node never mistakes claims of its previous run for its own.
/// Administrative operations go straight to the store and work in any state.
pub struct SchedulerNode {
    config: SchedulerConfig,
    store: Arc<dyn TriggerStore>,
    registry: Arc<dyn ClusterRegistry>,
    executors: ExecutorRegistry,
    state: watch::Sender<NodeState>,
    running: Mutex<Option<Running>>,
}

impl SchedulerNode {
    /// Validates `config` and registers the built-in executors.
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn TriggerStore>,
        registry: Arc<dyn ClusterRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        let executors = ExecutorRegistry::with_defaults(&config)?;
        let (state, _) = watch::channel(NodeState::Stopped);
        Ok(Self {
            config,
            store,
            registry,
            executors,
            state,
            running: Mutex::new(None),
        })
    }

    /// Node backed by a single store implementing both contracts.
    pub fn with_store<S>(config: SchedulerConfig, store: S) -> Result<Self>
    where
        S: TriggerStore + ClusterRegistry + 'static,
    {
        let store = Arc::new(store);
        Self::new(config, store.clone(), store)
    }

    /// Adds or replaces an executor. Takes effect on the next `start`.
    pub fn register_executor(&mut self, executor: Arc<dyn JobExecutor>) {
        self.executors.register(executor);
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn state(&self) -> NodeState {
        *self.state.borrow()
    }

    /// Receiver that sees every state transition.
    pub fn subscribe(&self) -> watch::Receiver<NodeState> {
        self.state.subscribe()
    }

    /// Id of the current run, `None` while stopped.
    pub async fn node_id(&self) -> Option<String> {
        self.running.lock().await.as_ref().map(|r| r.node_id.clone())
    }

    /// Live nodes of this namespace as seen by the last scan cycle.
    pub async fn live_nodes(&self) -> Vec<NodeHeartbeat> {
        match self.running.lock().await.as_ref() {
            Some(running) => running.engine.live_nodes(),
            None => Vec::new(),
        }
    }

    /// Dispatches executing right now on this node.
    pub async fn in_flight(&self) -> usize {
        match self.running.lock().await.as_ref() {
            Some(running) => running.pool.in_flight(),
            None => 0,
        }
    }

    fn transition(&self, to: NodeState) {
        let from = self.state.send_replace(to);
        if from != to {
            tracing::info!(from = %from, to = %to, namespace = %self.config.namespace, "Node state changed");
        }
    }

    /// Start the node.
    ///
    /// 1. Pings the store; a failure here is fatal and leaves the node stopped
    /// 2. Starts the timing wheel on the current runtime
    /// 3. Spawns the dispatch workers
    /// 4. Spawns the scheduler engine loop, which heartbeats immediately
    ///
    /// The node comes up in `Standby` when configured so, otherwise `Active`.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless the node is stopped; `StoreUnavailable` or
    /// `Database` if the store cannot be reached.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let current = self.state();
        if current != NodeState::Stopped {
            return Err(SchedulerError::InvalidState {
                from: current.to_string(),
                op: "start",
            });
        }
        self.transition(NodeState::Starting);

        match self.launch().await {
            Ok(launched) => {
                tracing::info!(node_id = %launched.node_id, standby = self.config.standby, "Scheduler node started");
                *running = Some(launched);
                self.transition(if self.config.standby {
                    NodeState::Standby
                } else {
                    NodeState::Active
                });
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Scheduler node failed to start");
                self.transition(NodeState::Stopped);
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<Running> {
        self.store.ping().await?;

        let suffix = Uuid::new_v4().simple().to_string();
        let node_id = format!("{}@{}", self.config.instance_name, &suffix[..8]);

        let wheel = Arc::new(TimingWheel::new(
            Arc::new(tokio::runtime::Handle::current()),
            self.config.wheel_tick(),
            self.config.wheel_size,
        )?);
        let held = HeldClaims::new();
        let pool = Arc::new(DispatchPool::new(
            node_id.clone(),
            Arc::clone(&self.store),
            self.executors.clone(),
            held.clone(),
            PoolSettings {
                workers: self.config.job_executor_pool_size,
                queue_size: self.config.job_executor_queue_size,
                default_timeout: self.config.default_job_timeout(),
                max_consecutive_failures: self.config.max_consecutive_failures,
            },
        ));
        let engine = Arc::new(SchedulerEngine::new(
            node_id.clone(),
            self.config.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            Arc::clone(&pool),
            Arc::clone(&wheel),
            held,
        ));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&engine).run(cancel.clone()));

        Ok(Running {
            node_id,
            engine,
            pool,
            wheel,
            cancel,
            task,
        })
    }

    /// Active -> Standby. Claims already made still run to completion.
    pub async fn pause(&self) -> Result<()> {
        self.switch_standby(true, NodeState::Active, "pause").await
    }

    /// Standby -> Active.
    pub async fn resume(&self) -> Result<()> {
        self.switch_standby(false, NodeState::Standby, "resume").await
    }

    async fn switch_standby(&self, standby: bool, from: NodeState, op: &'static str) -> Result<()> {
        let running = self.running.lock().await;
        let current = self.state();
        let Some(running) = running.as_ref().filter(|_| current == from) else {
            return Err(SchedulerError::InvalidState {
                from: current.to_string(),
                op,
            });
        };
        running.engine.set_standby(standby);
        self.transition(if standby {
            NodeState::Standby
        } else {
            NodeState::Active
        });
        Ok(())
    }

    /// Stop the node. A stopped node can be started again.
    ///
    /// 1. Stops the engine loop, so no new claims are made
    /// 2. Cancels triggers parked on the wheel and releases their claims
    /// 3. Waits up to `shutdown_timeout` for in-flight dispatches
    /// 4. Releases every claim this run still holds
    /// 5. Stops the timing wheel
    /// 6. Removes this node's heartbeat row
    ///
    /// Store errors during shutdown are logged, not returned: claims left
    /// behind become orphans once the heartbeat goes stale.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let Some(run) = running.take() else {
            return Ok(());
        };
        self.transition(NodeState::Stopping);
        let node_id = run.node_id.clone();

        run.cancel.cancel();
        if let Err(e) = run.task.await {
            tracing::error!(node_id = %node_id, error = %e, "Scheduler engine task failed");
        }

        let unparked = run.engine.unpark_all().await;
        let drained = run.pool.shutdown(self.config.shutdown_timeout()).await;

        let released = match self.store.release_all(&node_id).await {
            Ok(released) => released,
            Err(e) => {
                tracing::warn!(node_id = %node_id, error = %e, "Failed to release claims on stop");
                0
            }
        };

        let wheel = Arc::clone(&run.wheel);
        let leftover = match tokio::task::spawn_blocking(move || wheel.stop()).await {
            Ok(left) => left.len(),
            Err(e) => {
                tracing::warn!(error = %e, "Timing wheel stop panicked");
                0
            }
        };

        if let Err(e) = self.registry.remove_node(&node_id).await {
            tracing::warn!(node_id = %node_id, error = %e, "Failed to remove heartbeat row");
        }

        tracing::info!(
            node_id = %node_id,
            unparked,
            drained,
            released,
            leftover_timeouts = leftover,
            "Scheduler node stopped"
        );
        self.transition(NodeState::Stopped);
        Ok(())
    }

    /// Resolves once the node has reached `target`.
    pub async fn wait_for(&self, target: NodeState, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|state| *state == target))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    // Administration

    pub async fn add_job(&self, job: &Job) -> Result<Uuid> {
        self.store.insert_job(job).await?;
        tracing::info!(job_id = %job.id, name = %job.name, kind = %job.kind(), "Job added");
        Ok(job.id)
    }

    pub async fn update_job(&self, job: &Job) -> Result<()> {
        let mut job = job.clone();
        job.updated_at = Utc::now();
        self.store.update_job(&job).await
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Job> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or(SchedulerError::JobNotFound(job_id))
    }

    pub async fn list_jobs(&self, namespace: &str) -> Result<Vec<Job>> {
        self.store.list_jobs(namespace).await
    }

    pub async fn enable_job(&self, job_id: Uuid) -> Result<()> {
        self.store.set_job_enabled(job_id, true).await
    }

    /// Disabled jobs keep their triggers but none of them is claimed.
    pub async fn disable_job(&self, job_id: Uuid) -> Result<()> {
        self.store.set_job_enabled(job_id, false).await
    }

    /// Deletes the job and its triggers. Logs stay until retention purges them.
    pub async fn delete_job(&self, job_id: Uuid) -> Result<()> {
        self.store.delete_job(job_id).await?;
        tracing::info!(job_id = %job_id, "Job deleted");
        Ok(())
    }

    pub async fn add_trigger(&self, trigger: &Trigger) -> Result<Uuid> {
        if self.store.get_job(trigger.job_id).await?.is_none() {
            return Err(SchedulerError::JobNotFound(trigger.job_id));
        }
        self.store.insert_trigger(trigger).await?;
        tracing::info!(
            trigger_id = %trigger.id,
            job_id = %trigger.job_id,
            next_fire_time = ?trigger.next_fire_time,
            "Trigger added"
        );
        Ok(trigger.id)
    }

    pub async fn get_trigger(&self, trigger_id: Uuid) -> Result<Trigger> {
        self.store
            .get_trigger(trigger_id)
            .await?
            .ok_or(SchedulerError::TriggerNotFound(trigger_id))
    }

    pub async fn list_triggers(&self, namespace: &str) -> Result<Vec<Trigger>> {
        self.store.list_triggers(namespace).await
    }

    pub async fn pause_trigger(&self, trigger_id: Uuid) -> Result<()> {
        self.store
            .set_trigger_status(trigger_id, TriggerStatus::Paused)
            .await
    }

    /// Back to `Normal` with the failure counter reset. A slot missed while
    /// paused fires once on the next scan.
    pub async fn resume_trigger(&self, trigger_id: Uuid) -> Result<()> {
        self.store
            .set_trigger_status(trigger_id, TriggerStatus::Normal)
            .await
    }

    pub async fn disable_trigger(&self, trigger_id: Uuid) -> Result<()> {
        self.store
            .set_trigger_status(trigger_id, TriggerStatus::Disabled)
            .await
    }

    /// Fire out of schedule through the normal claim path. The regular
    /// schedule resumes after the manual fire.
    pub async fn fire_now(&self, trigger_id: Uuid) -> Result<()> {
        let trigger = self.get_trigger(trigger_id).await?;
        if trigger.status != TriggerStatus::Normal {
            return Err(SchedulerError::InvalidState {
                from: trigger.status.to_string(),
                op: "fire",
            });
        }
        self.store.request_fire(trigger_id, Utc::now()).await?;
        tracing::info!(trigger_id = %trigger_id, "Manual fire requested");
        Ok(())
    }

    pub async fn list_logs(&self, trigger_id: Option<Uuid>, limit: usize) -> Result<Vec<TriggerLog>> {
        self.store.list_logs(trigger_id, limit).await
    }

    pub async fn list_nodes(&self, namespace: &str) -> Result<Vec<NodeHeartbeat>> {
        self.registry.list_nodes(namespace).await
    }

    pub async fn list_namespaces(&self) -> Result<Vec<String>> {
        self.registry.list_namespaces().await
    }
}

impl std::fmt::Debug for SchedulerNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerNode")
            .field("namespace", &self.config.namespace)
            .field("instance_name", &self.config.instance_name)
            .field("state", &self.state())
            .field("executors", &self.executors)
            .finish()
    }
}
