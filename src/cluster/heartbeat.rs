use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SchedulerConfig;

/// One row of the cluster registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHeartbeat {
    /// Unique per node run; used as the trigger owner id.
    pub node_id: String,
    pub namespace: String,
    pub instance_name: String,
    pub last_heartbeat: DateTime<Utc>,
    pub load_weight: f64,
    pub standby: bool,
    pub started_at: DateTime<Utc>,
}

impl NodeHeartbeat {
    pub fn new(node_id: impl Into<String>, config: &SchedulerConfig) -> Self {
        let now = Utc::now();
        Self {
            node_id: node_id.into(),
            namespace: config.namespace.clone(),
            instance_name: config.instance_name.clone(),
            last_heartbeat: now,
            load_weight: config.load_weight,
            standby: config.standby,
            started_at: now,
        }
    }

    /// Copy stamped with the current time, ready to upsert.
    pub fn refreshed(&self, standby: bool) -> Self {
        Self {
            last_heartbeat: Utc::now(),
            standby,
            ..self.clone()
        }
    }

    pub fn is_alive(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        match (now - self.last_heartbeat).to_std() {
            Ok(age) => age < stale_after,
            // Heartbeat stamped in the future by a skewed clock still counts as alive.
            Err(_) => true,
        }
    }
}
