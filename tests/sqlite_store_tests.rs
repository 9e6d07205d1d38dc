//! SQLite store against a real database file, including a second connection
//! to the same file standing in for another process.


use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use uuid::Uuid;

use clustercron::cluster::NodeHeartbeat;
use clustercron::scheduler::{Job, LogOutcome, LogResult, Schedule, Trigger, TriggerLog, TriggerStatus};
use clustercron::store::{ClusterRegistry, SqliteStore, TriggerStore};
use clustercron::SchedulerNode;
use test_harness::{
    assert_eventually, register_dead_node, register_live_node, test_config, NAMESPACE,
};

const STALE_AFTER: Duration = Duration::from_secs(1);

fn open_pair(dir: &TempDir) -> (SqliteStore, SqliteStore) {
    let path = dir.path().join("scheduler.db");
    let first = SqliteStore::open(&path).unwrap();
    let second = SqliteStore::open(&path).unwrap();
    (first, second)
}

async fn trigger_due_in(store: &SqliteStore, job: &Job, name: &str, offset_ms: i64) -> Trigger {
    let mut trigger = Trigger::new(job, name, Schedule::every(Duration::from_secs(60))).unwrap();
    trigger.next_fire_time = Some(Utc::now() + chrono::Duration::milliseconds(offset_ms));
    store.insert_trigger(&trigger).await.unwrap();
    trigger
}

#[tokio::test]
async fn test_second_connection_sees_claims_and_releases() {
    let dir = TempDir::new().unwrap();
    let (a, b) = open_pair(&dir);
    let job = Job::script(NAMESPACE, "shared", "1");
    a.insert_job(&job).await.unwrap();
    let trigger = trigger_due_in(&a, &job, "t", 0).await;

    assert!(a.claim(trigger.id, "node-a", None, 0, STALE_AFTER).await.unwrap());
    let seen = b.get_trigger(trigger.id).await.unwrap().unwrap();
    assert_eq!(seen.owner.as_deref(), Some("node-a"));
    assert_eq!(seen.version, 1);

    // b cannot release a claim it does not own.
    assert!(!b.release(trigger.id, "node-b").await.unwrap());
    assert!(a.release(trigger.id, "node-a").await.unwrap());
    assert!(b.get_trigger(trigger.id).await.unwrap().unwrap().owner.is_none());
}

#[tokio::test]
async fn test_find_due_filters_and_orders() {
    let dir = TempDir::new().unwrap();
    let (store, _) = open_pair(&dir);

    let job = Job::script(NAMESPACE, "due", "1");
    store.insert_job(&job).await.unwrap();
    let later = trigger_due_in(&store, &job, "later", -100).await;
    let earlier = trigger_due_in(&store, &job, "earlier", -500).await;
    let future = trigger_due_in(&store, &job, "future", 60_000).await;
    let paused = trigger_due_in(&store, &job, "paused", -300).await;
    store
        .set_trigger_status(paused.id, TriggerStatus::Paused)
        .await
        .unwrap();

    let disabled_job = Job::script(NAMESPACE, "off", "1");
    store.insert_job(&disabled_job).await.unwrap();
    trigger_due_in(&store, &disabled_job, "off", -200).await;
    store.set_job_enabled(disabled_job.id, false).await.unwrap();

    let other_ns = Job::script("elsewhere", "other", "1");
    store.insert_job(&other_ns).await.unwrap();
    trigger_due_in(&store, &other_ns, "other", -200).await;

    let due = store.find_due_triggers(NAMESPACE, Utc::now()).await.unwrap();
    let ids: Vec<Uuid> = due.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![earlier.id, later.id]);

    let horizon = Utc::now() + chrono::Duration::seconds(120);
    let due = store.find_due_triggers(NAMESPACE, horizon).await.unwrap();
    assert_eq!(due.len(), 3);
    assert_eq!(due[2].id, future.id);
}

#[tokio::test]
async fn test_release_all_only_touches_own_claims() {
    let dir = TempDir::new().unwrap();
    let (store, _) = open_pair(&dir);
    let job = Job::script(NAMESPACE, "j", "1");
    store.insert_job(&job).await.unwrap();

    let mut mine = Vec::new();
    for i in 0..3 {
        let t = trigger_due_in(&store, &job, &format!("mine-{}", i), 0).await;
        assert!(store.claim(t.id, "leaving", None, 0, STALE_AFTER).await.unwrap());
        mine.push(t);
    }
    let theirs = trigger_due_in(&store, &job, "theirs", 0).await;
    assert!(store.claim(theirs.id, "staying", None, 0, STALE_AFTER).await.unwrap());

    assert_eq!(store.release_all("leaving").await.unwrap(), 3);
    for t in &mine {
        assert!(store.get_trigger(t.id).await.unwrap().unwrap().owner.is_none());
    }
    let row = store.get_trigger(theirs.id).await.unwrap().unwrap();
    assert_eq!(row.owner.as_deref(), Some("staying"));
}

#[tokio::test]
async fn test_request_fire_marks_manual_until_rescheduled() {
    let dir = TempDir::new().unwrap();
    let (store, _) = open_pair(&dir);
    let job = Job::script(NAMESPACE, "j", "1");
    store.insert_job(&job).await.unwrap();
    let trigger = trigger_due_in(&store, &job, "t", 60_000).await;

    let at = Utc::now();
    store.request_fire(trigger.id, at).await.unwrap();
    let row = store.get_trigger(trigger.id).await.unwrap().unwrap();
    assert!(row.manual_fire);
    assert_eq!(
        row.next_fire_time.map(|t| t.timestamp_millis()),
        Some(at.timestamp_millis())
    );

    let next = at + chrono::Duration::seconds(60);
    store
        .update_next_fire_time(trigger.id, Some(next), Some(at))
        .await
        .unwrap();
    let row = store.get_trigger(trigger.id).await.unwrap().unwrap();
    assert!(!row.manual_fire);
    assert_eq!(
        row.last_fire_time.map(|t| t.timestamp_millis()),
        Some(at.timestamp_millis())
    );

    assert!(store.request_fire(Uuid::new_v4(), at).await.is_err());
}

#[tokio::test]
async fn test_purge_keeps_running_entries() {
    let dir = TempDir::new().unwrap();
    let (store, _) = open_pair(&dir);
    let job = Job::script(NAMESPACE, "j", "1");
    store.insert_job(&job).await.unwrap();
    let trigger = trigger_due_in(&store, &job, "t", 0).await;

    let long_ago = Utc::now() - chrono::Duration::days(30);
    let mut finished = TriggerLog::running(&trigger, "n", long_ago, false, false);
    finished.start_time = long_ago;
    store.append_log(&finished).await.unwrap();
    store
        .finalize_log(
            finished.id,
            &LogResult {
                outcome: LogOutcome::Success,
                end_time: long_ago,
                exit_code: Some(0),
                output: None,
                error: None,
                retry_count: 0,
            },
        )
        .await
        .unwrap();

    let mut stuck = TriggerLog::running(&trigger, "n", long_ago, false, false);
    stuck.start_time = long_ago;
    store.append_log(&stuck).await.unwrap();

    let recent = TriggerLog::running(&trigger, "n", Utc::now(), false, false);
    store.append_log(&recent).await.unwrap();

    let cutoff = Utc::now() - chrono::Duration::days(7);
    assert_eq!(store.purge_logs(cutoff).await.unwrap(), 1);
    let left: Vec<Uuid> = store
        .list_logs(Some(trigger.id), 10)
        .await
        .unwrap()
        .iter()
        .map(|l| l.id)
        .collect();
    assert_eq!(left.len(), 2);
    assert!(left.contains(&stuck.id));
    assert!(left.contains(&recent.id));
}

#[tokio::test]
async fn test_node_registry_liveness_and_removal() {
    let dir = TempDir::new().unwrap();
    let (a, b) = open_pair(&dir);

    register_live_node(&a, "alive@1").await;
    register_dead_node(&a, "dead@2", Duration::from_secs(10)).await;
    let config = test_config("elsewhere", 50);
    let mut other = NodeHeartbeat::new("other@3", &config);
    other.namespace = "other-ns".into();
    b.heartbeat(&other).await.unwrap();

    let live = b
        .list_live_nodes(NAMESPACE, Duration::from_secs(1))
        .await
        .unwrap();
    let ids: Vec<_> = live.iter().map(|n| n.node_id.as_str()).collect();
    assert_eq!(ids, vec!["alive@1"]);
    assert_eq!(b.list_nodes(NAMESPACE).await.unwrap().len(), 2);
    assert_eq!(
        a.list_namespaces().await.unwrap(),
        vec!["other-ns".to_string(), NAMESPACE.to_string()]
    );

    a.remove_node("alive@1").await.unwrap();
    assert!(b
        .list_live_nodes(NAMESPACE, Duration::from_secs(1))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_node_runs_a_trigger_against_sqlite() {
    let dir = TempDir::new().unwrap();
    let (store, observer) = open_pair(&dir);
    let node = SchedulerNode::with_store(test_config("disk", 50), store).unwrap();

    let job = Job::script(NAMESPACE, "persisted", "\"ok\"");
    node.add_job(&job).await.unwrap();
    let mut trigger =
        Trigger::new(&job, "soon", Schedule::every(Duration::from_secs(3600))).unwrap();
    trigger.next_fire_time = Some(Utc::now() + chrono::Duration::milliseconds(100));
    node.add_trigger(&trigger).await.unwrap();
    node.start().await.unwrap();

    let (logs_store, trigger_id) = (&observer, trigger.id);
    assert_eventually(
        || async move {
            let logs = logs_store.list_logs(Some(trigger_id), 10).await.unwrap();
            logs.first().is_some_and(|l| l.outcome == LogOutcome::Success)
        },
        Duration::from_secs(3),
        "execution should be visible through the second connection",
    )
    .await;
    let node_id = node.node_id().await.unwrap();
    assert_eq!(observer.list_nodes(NAMESPACE).await.unwrap().len(), 1);
    node.stop().await.unwrap();

    let logs = observer.list_logs(Some(trigger.id), 10).await.unwrap();
    assert_eq!(logs[0].node_id, node_id);
    assert_eq!(logs[0].output.as_deref(), Some("ok"));
    assert!(observer.list_nodes(NAMESPACE).await.unwrap().is_empty());
    let row = observer.get_trigger(trigger.id).await.unwrap().unwrap();
    assert!(row.owner.is_none());
}
