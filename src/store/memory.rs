use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::cluster::NodeHeartbeat;
use crate::error::{Result, SchedulerError};
use crate::scheduler::{Job, LogResult, Trigger, TriggerLog, TriggerStatus};
use crate::store::{liveness_cutoff, ClusterRegistry, TriggerStore};

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<Uuid, Job>,
    triggers: HashMap<Uuid, Trigger>,
    logs: Vec<TriggerLog>,
    nodes: HashMap<String, NodeHeartbeat>,
}

/// In-process store implementing both contracts.
///
/// Clones share the same tables, so several simulated nodes can run against
/// one instance. Every operation takes a single lock, which makes `claim` a
/// true compare-and-set.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) the connection. While unavailable every
    /// call fails with `StoreUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::Release);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(SchedulerError::StoreUnavailable(
                "memory store switched off".into(),
            ));
        }
        Ok(())
    }

    fn with_trigger<T>(
        &self,
        trigger_id: Uuid,
        f: impl FnOnce(&mut Trigger) -> T,
    ) -> Result<T> {
        self.check()?;
        let mut state = self.state.lock();
        let trigger = state
            .triggers
            .get_mut(&trigger_id)
            .ok_or(SchedulerError::TriggerNotFound(trigger_id))?;
        Ok(f(trigger))
    }
}

#[async_trait]
impl TriggerStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn insert_job(&self, job: &Job) -> Result<()> {
        self.check()?;
        self.state.lock().jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        let existing = state
            .jobs
            .get_mut(&job.id)
            .ok_or(SchedulerError::JobNotFound(job.id))?;
        *existing = Job {
            updated_at: Utc::now(),
            run_count: existing.run_count,
            ..job.clone()
        };
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        self.check()?;
        Ok(self.state.lock().jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, namespace: &str) -> Result<Vec<Job>> {
        self.check()?;
        let mut jobs: Vec<Job> = self
            .state
            .lock()
            .jobs
            .values()
            .filter(|j| j.namespace == namespace)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn set_job_enabled(&self, id: Uuid, enabled: bool) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or(SchedulerError::JobNotFound(id))?;
        job.enabled = enabled;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_job(&self, id: Uuid) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        if state.jobs.remove(&id).is_none() {
            return Err(SchedulerError::JobNotFound(id));
        }
        state.triggers.retain(|_, t| t.job_id != id);
        Ok(())
    }

    async fn increment_run_count(&self, id: Uuid) -> Result<u64> {
        self.check()?;
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or(SchedulerError::JobNotFound(id))?;
        job.run_count += 1;
        Ok(job.run_count)
    }

    async fn insert_trigger(&self, trigger: &Trigger) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        if !state.jobs.contains_key(&trigger.job_id) {
            return Err(SchedulerError::JobNotFound(trigger.job_id));
        }
        state.triggers.insert(trigger.id, trigger.clone());
        Ok(())
    }

    async fn get_trigger(&self, id: Uuid) -> Result<Option<Trigger>> {
        self.check()?;
        Ok(self.state.lock().triggers.get(&id).cloned())
    }

    async fn list_triggers(&self, namespace: &str) -> Result<Vec<Trigger>> {
        self.check()?;
        let mut triggers: Vec<Trigger> = self
            .state
            .lock()
            .triggers
            .values()
            .filter(|t| t.namespace == namespace)
            .cloned()
            .collect();
        triggers.sort_by_key(|t| t.created_at);
        Ok(triggers)
    }

    async fn find_due_triggers(
        &self,
        namespace: &str,
        before: DateTime<Utc>,
    ) -> Result<Vec<Trigger>> {
        self.check()?;
        let state = self.state.lock();
        let mut due: Vec<Trigger> = state
            .triggers
            .values()
            .filter(|t| {
                t.namespace == namespace
                    && t.status == TriggerStatus::Normal
                    && t.next_fire_time.is_some_and(|next| next <= before)
                    && state.jobs.get(&t.job_id).is_some_and(|j| j.enabled)
            })
            .cloned()
            .collect();
        due.sort_by_key(|t| t.next_fire_time);
        Ok(due)
    }

    async fn claim(
        &self,
        trigger_id: Uuid,
        node_id: &str,
        expected_owner: Option<&str>,
        expected_version: u64,
        stale_after: Duration,
    ) -> Result<bool> {
        self.check()?;
        let cutoff = liveness_cutoff(stale_after);
        let mut state = self.state.lock();
        let State {
            triggers, nodes, ..
        } = &mut *state;
        let Some(t) = triggers.get_mut(&trigger_id) else {
            return Ok(false);
        };
        if t.owner.as_deref() != expected_owner || t.version != expected_version {
            return Ok(false);
        }
        if let Some(owner) = t.owner.as_deref() {
            let owner_alive = nodes
                .get(owner)
                .is_some_and(|n| n.last_heartbeat > cutoff);
            if owner != node_id && owner_alive {
                return Ok(false);
            }
        }
        t.owner = Some(node_id.to_string());
        t.version += 1;
        t.updated_at = Utc::now();
        Ok(true)
    }

    async fn release(&self, trigger_id: Uuid, node_id: &str) -> Result<bool> {
        self.check()?;
        let mut state = self.state.lock();
        // A trigger deleted while in flight has nothing left to release.
        let Some(t) = state.triggers.get_mut(&trigger_id) else {
            return Ok(false);
        };
        if t.owner.as_deref() != Some(node_id) {
            return Ok(false);
        }
        t.owner = None;
        t.updated_at = Utc::now();
        Ok(true)
    }

    async fn release_all(&self, node_id: &str) -> Result<usize> {
        self.check()?;
        let mut released = 0;
        for t in self.state.lock().triggers.values_mut() {
            if t.owner.as_deref() == Some(node_id) {
                t.owner = None;
                t.updated_at = Utc::now();
                released += 1;
            }
        }
        Ok(released)
    }

    async fn update_next_fire_time(
        &self,
        trigger_id: Uuid,
        next: Option<DateTime<Utc>>,
        last_fire: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.with_trigger(trigger_id, |t| {
            t.next_fire_time = next;
            t.last_fire_time = last_fire;
            t.manual_fire = false;
            t.updated_at = Utc::now();
        })
    }

    async fn set_trigger_status(&self, trigger_id: Uuid, status: TriggerStatus) -> Result<()> {
        self.with_trigger(trigger_id, |t| {
            t.status = status;
            if status == TriggerStatus::Normal {
                t.consecutive_failures = 0;
            }
            t.updated_at = Utc::now();
        })
    }

    async fn request_fire(&self, trigger_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.with_trigger(trigger_id, |t| {
            t.next_fire_time = Some(at);
            t.manual_fire = true;
            t.updated_at = Utc::now();
        })
    }

    async fn record_outcome(&self, trigger_id: Uuid, success: bool) -> Result<u32> {
        self.with_trigger(trigger_id, |t| {
            if success {
                t.consecutive_failures = 0;
            } else {
                t.consecutive_failures += 1;
            }
            t.consecutive_failures
        })
    }

    async fn append_log(&self, entry: &TriggerLog) -> Result<Uuid> {
        self.check()?;
        self.state.lock().logs.push(entry.clone());
        Ok(entry.id)
    }

    async fn finalize_log(&self, log_id: Uuid, result: &LogResult) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        match state.logs.iter_mut().find(|l| l.id == log_id) {
            Some(log) if !log.is_final() => {
                log.apply(result.clone());
                Ok(())
            }
            Some(_) => {
                tracing::warn!(log_id = %log_id, "Log entry already finalized");
                Ok(())
            }
            None => Err(SchedulerError::StoreUnavailable(format!(
                "log entry {log_id} missing"
            ))),
        }
    }

    async fn list_logs(&self, trigger_id: Option<Uuid>, limit: usize) -> Result<Vec<TriggerLog>> {
        self.check()?;
        let mut logs: Vec<TriggerLog> = self
            .state
            .lock()
            .logs
            .iter()
            .filter(|l| trigger_id.map_or(true, |id| l.trigger_id == id))
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        logs.truncate(limit);
        Ok(logs)
    }

    async fn fail_running_logs(
        &self,
        node_id: Option<&str>,
        started_before: DateTime<Utc>,
        error: &str,
    ) -> Result<usize> {
        self.check()?;
        let mut failed = 0;
        for log in self.state.lock().logs.iter_mut() {
            if !log.is_final()
                && log.start_time < started_before
                && node_id.map_or(true, |id| log.node_id == id)
            {
                log.apply(LogResult::failure(error));
                failed += 1;
            }
        }
        Ok(failed)
    }

    async fn purge_logs(&self, before: DateTime<Utc>) -> Result<usize> {
        self.check()?;
        let mut state = self.state.lock();
        let len = state.logs.len();
        state
            .logs
            .retain(|l| !(l.is_final() && l.start_time < before));
        Ok(len - state.logs.len())
    }
}

#[async_trait]
impl ClusterRegistry for MemoryStore {
    async fn heartbeat(&self, node: &NodeHeartbeat) -> Result<()> {
        self.check()?;
        self.state
            .lock()
            .nodes
            .insert(node.node_id.clone(), node.clone());
        Ok(())
    }

    async fn list_live_nodes(
        &self,
        namespace: &str,
        stale_after: Duration,
    ) -> Result<Vec<NodeHeartbeat>> {
        self.check()?;
        let cutoff = liveness_cutoff(stale_after);
        Ok(self
            .state
            .lock()
            .nodes
            .values()
            .filter(|n| n.namespace == namespace && n.last_heartbeat > cutoff)
            .cloned()
            .collect())
    }

    async fn list_nodes(&self, namespace: &str) -> Result<Vec<NodeHeartbeat>> {
        self.check()?;
        let mut nodes: Vec<NodeHeartbeat> = self
            .state
            .lock()
            .nodes
            .values()
            .filter(|n| n.namespace == namespace)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.instance_name.cmp(&b.instance_name));
        Ok(nodes)
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        self.check()?;
        let state = self.state.lock();
        let namespaces: BTreeSet<String> = state
            .nodes
            .values()
            .map(|n| n.namespace.clone())
            .chain(state.jobs.values().map(|j| j.namespace.clone()))
            .collect();
        Ok(namespaces.into_iter().collect())
    }

    async fn remove_node(&self, node_id: &str) -> Result<()> {
        self.check()?;
        self.state.lock().nodes.remove(node_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::scheduler::{LogOutcome, Schedule, ShellType};

    async fn seeded() -> (MemoryStore, Job, Trigger) {
        let store = MemoryStore::new();
        let job = Job::shell("default", "j", ShellType::Sh, "true");
        let trigger = Trigger::new(&job, "t", Schedule::every(Duration::from_secs(1))).unwrap();
        store.insert_job(&job).await.unwrap();
        store.insert_trigger(&trigger).await.unwrap();
        (store, job, trigger)
    }

    const STALE: Duration = Duration::from_secs(3);

    #[tokio::test]
    async fn claim_is_compare_and_set() {
        let (store, _, trigger) = seeded().await;

        assert!(store.claim(trigger.id, "a", None, 0, STALE).await.unwrap());
        // Stale expectations lose.
        assert!(!store.claim(trigger.id, "b", None, 0, STALE).await.unwrap());
        assert!(!store.claim(trigger.id, "b", Some("a"), 0, STALE).await.unwrap());
        // "a" never heartbeated, so takeover with the current owner and version wins.
        assert!(store.claim(trigger.id, "b", Some("a"), 1, STALE).await.unwrap());

        let row = store.get_trigger(trigger.id).await.unwrap().unwrap();
        assert_eq!(row.owner.as_deref(), Some("b"));
        assert_eq!(row.version, 2);
    }

    #[tokio::test]
    async fn claim_of_live_owner_is_refused() {
        let (store, _, trigger) = seeded().await;
        let config = SchedulerConfig::new("default", "a");
        store.heartbeat(&NodeHeartbeat::new("a", &config)).await.unwrap();
        assert!(store.claim(trigger.id, "a", None, 0, STALE).await.unwrap());

        // Correct owner and version, but "a" is still heartbeating.
        assert!(!store.claim(trigger.id, "b", Some("a"), 1, STALE).await.unwrap());
        // The owner itself may re-take its leaked claim.
        assert!(store.claim(trigger.id, "a", Some("a"), 1, STALE).await.unwrap());

        let mut silent = NodeHeartbeat::new("a", &config);
        silent.last_heartbeat = Utc::now() - chrono::Duration::seconds(10);
        store.heartbeat(&silent).await.unwrap();
        assert!(store.claim(trigger.id, "b", Some("a"), 2, STALE).await.unwrap());
    }

    #[tokio::test]
    async fn release_only_by_owner() {
        let (store, _, trigger) = seeded().await;
        store.claim(trigger.id, "a", None, 0, STALE).await.unwrap();

        assert!(!store.release(trigger.id, "b").await.unwrap());
        assert!(store.release(trigger.id, "a").await.unwrap());
        assert!(!store.release(trigger.id, "a").await.unwrap());
    }

    #[tokio::test]
    async fn due_triggers_skip_disabled_jobs_and_paused_triggers() {
        let (store, job, trigger) = seeded().await;
        let horizon = Utc::now() + chrono::Duration::seconds(5);
        assert_eq!(store.find_due_triggers("default", horizon).await.unwrap().len(), 1);
        assert!(store.find_due_triggers("other", horizon).await.unwrap().is_empty());

        store.set_job_enabled(job.id, false).await.unwrap();
        assert!(store.find_due_triggers("default", horizon).await.unwrap().is_empty());

        store.set_job_enabled(job.id, true).await.unwrap();
        store
            .set_trigger_status(trigger.id, TriggerStatus::Paused)
            .await
            .unwrap();
        assert!(store.find_due_triggers("default", horizon).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finalized_log_is_immutable() {
        let (store, _, trigger) = seeded().await;
        let log = TriggerLog::running(&trigger, "a", Utc::now(), false, false);
        let id = store.append_log(&log).await.unwrap();

        store.finalize_log(id, &LogResult::failure("first")).await.unwrap();
        store.finalize_log(id, &LogResult::failure("second")).await.unwrap();

        let logs = store.list_logs(Some(trigger.id), 10).await.unwrap();
        assert_eq!(logs[0].error.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn purge_keeps_running_entries() {
        let (store, _, trigger) = seeded().await;
        let done = TriggerLog::skipped(&trigger, "a", Utc::now());
        let running = TriggerLog::running(&trigger, "a", Utc::now(), false, false);
        store.append_log(&done).await.unwrap();
        store.append_log(&running).await.unwrap();

        let purged = store
            .purge_logs(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.list_logs(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stuck_running_entries_can_be_failed() {
        let (store, _, trigger) = seeded().await;
        let mut old = TriggerLog::running(&trigger, "a", Utc::now(), false, false);
        old.start_time = Utc::now() - chrono::Duration::days(10);
        let other_node = TriggerLog::running(&trigger, "b", Utc::now(), false, false);
        let mine = TriggerLog::running(&trigger, "a", Utc::now(), false, false);
        for log in [&old, &other_node, &mine] {
            store.append_log(log).await.unwrap();
        }

        let week_ago = Utc::now() - chrono::Duration::days(7);
        assert_eq!(store.fail_running_logs(None, week_ago, "abandoned").await.unwrap(), 1);
        let later = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(store.fail_running_logs(Some("a"), later, "aborted").await.unwrap(), 1);

        let logs = store.list_logs(Some(trigger.id), 10).await.unwrap();
        let by_id = |id| logs.iter().find(|l| l.id == id).unwrap();
        assert_eq!(by_id(old.id).error.as_deref(), Some("abandoned"));
        assert_eq!(by_id(mine.id).outcome, LogOutcome::Failure);
        assert_eq!(by_id(mine.id).error.as_deref(), Some("aborted"));
        assert!(!by_id(other_node.id).is_final());
        assert_eq!(store.purge_logs(week_ago).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn run_count_survives_job_updates() {
        let (store, job, _) = seeded().await;
        assert_eq!(store.increment_run_count(job.id).await.unwrap(), 1);
        assert_eq!(store.increment_run_count(job.id).await.unwrap(), 2);

        let mut edited = job.clone();
        edited.name = "renamed".into();
        store.update_job(&edited).await.unwrap();
        let row = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(row.name, "renamed");
        assert_eq!(row.run_count, 2);
        assert!(matches!(
            store.increment_run_count(Uuid::new_v4()).await,
            Err(SchedulerError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let (store, _, trigger) = seeded().await;
        store.set_available(false);
        assert!(matches!(
            store.ping().await,
            Err(SchedulerError::StoreUnavailable(_))
        ));
        assert!(store.claim(trigger.id, "a", None, 0, STALE).await.is_err());

        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn live_nodes_respect_stale_after() {
        let store = MemoryStore::new();
        let config = SchedulerConfig::new("default", "a");
        let fresh = NodeHeartbeat::new("fresh", &config);
        let mut stale = NodeHeartbeat::new("stale", &config);
        stale.last_heartbeat = Utc::now() - chrono::Duration::seconds(10);
        store.heartbeat(&fresh).await.unwrap();
        store.heartbeat(&stale).await.unwrap();

        let live = store
            .list_live_nodes("default", Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].node_id, "fresh");
        assert_eq!(store.list_nodes("default").await.unwrap().len(), 2);
    }
}
