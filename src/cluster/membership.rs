use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;

use crate::cluster::heartbeat::NodeHeartbeat;

/// How a trigger's current owner looks from this node's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerState {
    Unclaimed,
    /// Held by this node (in flight or parked on the timing wheel).
    Mine,
    /// Held by another node that is still heartbeating.
    Live(String),
    /// Held by a node whose heartbeat went stale; claimable.
    Orphaned(String),
}

/// Snapshot of the live nodes in one namespace, refreshed every scan cycle.
#[derive(Debug)]
pub struct Membership {
    node_id: String,
    stale_after: Duration,
    live: HashMap<String, NodeHeartbeat>,
}

impl Membership {
    pub fn new(node_id: impl Into<String>, stale_after: Duration) -> Self {
        Self {
            node_id: node_id.into(),
            stale_after,
            live: HashMap::new(),
        }
    }

    /// Replace the snapshot with freshly listed nodes. Rows that are already
    /// stale by local clock are dropped as well.
    pub fn update(&mut self, nodes: Vec<NodeHeartbeat>) {
        let now = Utc::now();
        let before: Vec<String> = self.live.keys().cloned().collect();
        self.live = nodes
            .into_iter()
            .filter(|n| n.is_alive(now, self.stale_after))
            .map(|n| (n.node_id.clone(), n))
            .collect();

        for gone in before.iter().filter(|id| !self.live.contains_key(*id)) {
            tracing::info!(node_id = %gone, "Node heartbeat went stale");
        }
        for joined in self.live.keys().filter(|id| !before.contains(id)) {
            if *joined != self.node_id {
                tracing::info!(node_id = %joined, "Node joined cluster");
            }
        }
    }

    pub fn owner_state(&self, owner: Option<&str>) -> OwnerState {
        match owner {
            None => OwnerState::Unclaimed,
            Some(id) if id == self.node_id => OwnerState::Mine,
            Some(id) if self.live.contains_key(id) => OwnerState::Live(id.to_string()),
            Some(id) => OwnerState::Orphaned(id.to_string()),
        }
    }

    pub fn live_nodes(&self) -> Vec<&NodeHeartbeat> {
        self.live.values().collect()
    }

    /// Instance names of live nodes that are not in standby.
    pub fn active_instances(&self) -> Vec<&str> {
        self.live
            .values()
            .filter(|n| !n.standby)
            .map(|n| n.instance_name.as_str())
            .collect()
    }
}
