//! Hashed timing wheel and timer helpers.
//!
//! The wheel gives O(1) scheduling and cancellation for large numbers of
//! approximately-timed callbacks. Precision is bounded by the tick duration.
//! The scheduler uses it for its own cadence (scan ticks, retention sweeps)
//! and to hold claimed triggers until their exact fire time. Cross-node
//! firing decisions never depend on it.
//!
//! # Components
//!
//! - [`TimingWheel`]: bucketed wheel driven by a dedicated tick thread
//! - [`Timeout`]: handle to one scheduled callback (pending, expired or cancelled)
//! - [`TaskExecutor`]: where expired callbacks run
//! - [`jitter`]: randomized delay stretch

pub mod jitter;
pub mod wheel;

pub use jitter::jittered;
pub use wheel::{TaskExecutor, Timeout, TimerTask, TimingWheel};
