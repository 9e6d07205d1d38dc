//! Node lifecycle: state transitions, standby, restart identity and the
//! cleanup a graceful stop performs.


use std::time::Duration;

use chrono::Utc;

use clustercron::scheduler::{Job, LogOutcome, Schedule, Trigger};
use clustercron::store::{ClusterRegistry, MemoryStore, TriggerStore};
use clustercron::{NodeState, SchedulerError, SchedulerNode};
use test_harness::{assert_eventually, test_config, TestCluster, NAMESPACE};

#[tokio::test]
async fn test_transitions_are_observable() {
    let node = SchedulerNode::with_store(test_config("watched", 50), MemoryStore::new()).unwrap();
    let mut rx = node.subscribe();
    assert_eq!(*rx.borrow_and_update(), NodeState::Stopped);

    node.start().await.unwrap();
    assert!(rx.has_changed().unwrap());
    assert_eq!(*rx.borrow_and_update(), NodeState::Active);

    node.pause().await.unwrap();
    assert_eq!(*rx.borrow_and_update(), NodeState::Standby);
    node.resume().await.unwrap();
    assert_eq!(*rx.borrow_and_update(), NodeState::Active);

    node.stop().await.unwrap();
    assert_eq!(*rx.borrow_and_update(), NodeState::Stopped);
}

#[tokio::test]
async fn test_pause_and_resume_need_the_matching_state() {
    let node = SchedulerNode::with_store(test_config("strict", 50), MemoryStore::new()).unwrap();
    assert!(matches!(
        node.pause().await,
        Err(SchedulerError::InvalidState { op: "pause", .. })
    ));

    node.start().await.unwrap();
    assert!(matches!(
        node.resume().await,
        Err(SchedulerError::InvalidState { op: "resume", .. })
    ));
    node.pause().await.unwrap();
    assert!(node.pause().await.is_err());
    node.stop().await.unwrap();
    // Stopping twice is harmless.
    node.stop().await.unwrap();
    assert_eq!(node.state(), NodeState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_configured_standby_node_never_claims() {
    let store = MemoryStore::new();
    let mut config = test_config("spare", 30);
    config.standby = true;
    let node = SchedulerNode::with_store(config, store.clone()).unwrap();

    let job = Job::script(NAMESPACE, "j", "1");
    node.add_job(&job).await.unwrap();
    let mut trigger = Trigger::new(&job, "t", Schedule::every(Duration::from_millis(50))).unwrap();
    trigger.next_fire_time = Some(Utc::now());
    node.add_trigger(&trigger).await.unwrap();

    node.start().await.unwrap();
    assert_eq!(node.state(), NodeState::Standby);
    tokio::time::sleep(Duration::from_millis(250)).await;

    // Heartbeating, flagged as standby, but nothing ran.
    let nodes = store.list_nodes(NAMESPACE).await.unwrap();
    assert_eq!(nodes.len(), 1);
    assert!(nodes[0].standby);
    assert!(store.list_logs(Some(trigger.id), 10).await.unwrap().is_empty());

    // Promoting it picks the trigger up.
    node.resume().await.unwrap();
    let (logs_store, trigger_id) = (&store, trigger.id);
    assert_eventually(
        || async move { !logs_store.list_logs(Some(trigger_id), 10).await.unwrap().is_empty() },
        Duration::from_secs(2),
        "resumed node should fire the trigger",
    )
    .await;
    node.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_paused_node_stops_claiming_while_others_continue() {
    let cluster = TestCluster::new(2, 30).await;
    cluster.node(0).pause().await.unwrap();
    assert_eq!(cluster.count_active().await, 1);

    let (_job, trigger) = cluster
        .add_interval_job("1", Duration::from_millis(60), Duration::ZERO)
        .await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    let active_id = cluster.node(1).node_id().await.unwrap();
    cluster.shutdown().await;

    let logs = cluster.logs(trigger.id).await;
    assert!(!logs.is_empty());
    assert!(logs.iter().all(|l| l.node_id == active_id));
}

#[tokio::test]
async fn test_restart_uses_a_new_node_id() {
    let node = SchedulerNode::with_store(test_config("phoenix", 50), MemoryStore::new()).unwrap();
    assert!(node.node_id().await.is_none());

    node.start().await.unwrap();
    let first = node.node_id().await.unwrap();
    assert!(first.starts_with("phoenix@"));
    node.stop().await.unwrap();
    assert!(node.node_id().await.is_none());

    node.start().await.unwrap();
    let second = node.node_id().await.unwrap();
    assert!(second.starts_with("phoenix@"));
    assert_ne!(first, second);
    node.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_releases_claims_and_removes_heartbeat() {
    let store = MemoryStore::new();
    let node = SchedulerNode::with_store(test_config("tidy", 50), store.clone()).unwrap();

    let job = Job::script(NAMESPACE, "j", "1");
    node.add_job(&job).await.unwrap();
    // Inside the lookahead: claimed and parked on the wheel, not yet run.
    let mut trigger = Trigger::new(&job, "t", Schedule::every(Duration::from_secs(3600))).unwrap();
    let slot = Utc::now() + chrono::Duration::milliseconds(45);
    trigger.next_fire_time = Some(slot);
    node.add_trigger(&trigger).await.unwrap();

    node.start().await.unwrap();
    let node_id = node.node_id().await.unwrap();
    let (rows, trigger_id, owner) = (&store, trigger.id, node_id.clone());
    let claimed = test_harness::wait_for(
        || {
            let owner = owner.clone();
            async move {
                let row = rows.get_trigger(trigger_id).await.unwrap().unwrap();
                row.owner.as_deref() == Some(owner.as_str())
            }
        },
        Duration::from_millis(200),
        Duration::from_millis(2),
    )
    .await;
    node.stop().await.unwrap();

    let row = store.get_trigger(trigger.id).await.unwrap().unwrap();
    assert!(row.owner.is_none(), "claim survived stop");
    let logs = store.list_logs(Some(trigger.id), 10).await.unwrap();
    if claimed && logs.is_empty() {
        // Stopped while parked: the slot is handed back untouched.
        assert_eq!(row.next_fire_time, Some(slot));
    }
    assert!(store.list_nodes(NAMESPACE).await.unwrap().is_empty());
    assert_eq!(node.state(), NodeState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forced_stop_finalizes_running_log_as_failure() {
    let store = MemoryStore::new();
    let mut config = test_config("hasty", 30);
    config.shutdown_timeout_ms = 100;
    let node = SchedulerNode::with_store(config, store.clone()).unwrap();

    let job = Job::script(NAMESPACE, "spin", "loop { }").with_timeout(Duration::from_secs(1));
    node.add_job(&job).await.unwrap();
    let mut trigger = Trigger::new(&job, "t", Schedule::every(Duration::from_secs(3600))).unwrap();
    trigger.next_fire_time = Some(Utc::now());
    node.add_trigger(&trigger).await.unwrap();

    node.start().await.unwrap();
    let (logs_store, trigger_id) = (&store, trigger.id);
    assert_eventually(
        || async move {
            let logs = logs_store.list_logs(Some(trigger_id), 10).await.unwrap();
            logs.iter().any(|l| l.outcome == LogOutcome::Running)
        },
        Duration::from_secs(2),
        "the spinning job should start",
    )
    .await;
    node.stop().await.unwrap();

    let logs = store.list_logs(Some(trigger.id), 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].outcome, LogOutcome::Failure);
    assert!(logs[0].end_time.is_some());
    assert!(logs[0].error.as_deref().unwrap().contains("aborted"));

    // Finalized rows are subject to retention like any other.
    let purged = store
        .purge_logs(Utc::now() + chrono::Duration::days(365))
        .await
        .unwrap();
    assert_eq!(purged, 1);
}

#[tokio::test]
async fn test_start_fails_cleanly_when_store_is_down() {
    let store = MemoryStore::new();
    store.set_available(false);
    let node = SchedulerNode::with_store(test_config("offline", 50), store.clone()).unwrap();

    let err = node.start().await.unwrap_err();
    assert!(err.is_store_failure());
    assert_eq!(node.state(), NodeState::Stopped);

    store.set_available(true);
    node.start().await.unwrap();
    assert_eq!(node.state(), NodeState::Active);
    node.stop().await.unwrap();
}

#[tokio::test]
async fn test_wait_for_times_out_on_unreached_state() {
    let node = SchedulerNode::with_store(test_config("patient", 50), MemoryStore::new()).unwrap();
    assert!(!node.wait_for(NodeState::Active, Duration::from_millis(50)).await);
    node.start().await.unwrap();
    assert!(node.wait_for(NodeState::Active, Duration::from_millis(50)).await);
    node.stop().await.unwrap();
}
