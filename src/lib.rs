pub mod cluster;
pub mod config;
pub mod error;
pub mod node;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod timer;
pub mod worker;

pub use config::SchedulerConfig;
pub use error::{Result, SchedulerError};
pub use node::{NodeState, SchedulerNode};
