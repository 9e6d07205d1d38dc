//! Cluster membership.
//!
//! The heartbeat table is the only liveness signal nodes share. Each node
//! upserts its own row every heartbeat interval; a row older than
//! `stale_after` marks its node dead, and triggers it still owns become
//! orphans that any live node may take over.

pub mod heartbeat;
pub mod membership;

pub use heartbeat::NodeHeartbeat;
pub use membership::{Membership, OwnerState};
