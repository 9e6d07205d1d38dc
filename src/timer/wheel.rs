use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Result, SchedulerError};

/// Callback run when a [`Timeout`] expires.
pub type TimerTask = Box<dyn FnOnce(&Timeout) + Send + 'static>;

/// Execution context for expired timer callbacks.
///
/// The tick thread only hands work over; a slow or panicking callback can
/// never delay the wheel.
pub trait TaskExecutor: Send + Sync + 'static {
    fn execute(&self, job: Box<dyn FnOnce() + Send + 'static>);
}

impl TaskExecutor for tokio::runtime::Handle {
    fn execute(&self, job: Box<dyn FnOnce() + Send + 'static>) {
        self.spawn(async move { job() });
    }
}

const TIMEOUT_PENDING: u8 = 0;
const TIMEOUT_CANCELLED: u8 = 1;
const TIMEOUT_EXPIRED: u8 = 2;

const WHEEL_STARTED: u8 = 0;
const WHEEL_SHUTDOWN: u8 = 1;

/// Upper bound on timeouts moved from the submission queue per tick.
const MAX_TRANSFER_PER_TICK: usize = 100_000;

struct TimeoutInner {
    id: u64,
    /// Offset from the wheel's start instant.
    deadline: Duration,
    started_at: Instant,
    state: AtomicU8,
    task: Mutex<Option<TimerTask>>,
    pending: Arc<AtomicUsize>,
}

/// Handle to a scheduled callback.
///
/// Lifecycle is `Pending -> Expired` or `Pending -> Cancelled`; a timeout is
/// never reused.
#[derive(Clone)]
pub struct Timeout {
    inner: Arc<TimeoutInner>,
}

impl Timeout {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Absolute instant the callback becomes due.
    pub fn deadline(&self) -> Instant {
        self.inner.started_at + self.inner.deadline
    }

    /// Cancel the timeout. Returns false if it already expired or was cancelled.
    ///
    /// Only flips a flag; the tick thread unlinks cancelled entries when it next
    /// sweeps their bucket.
    pub fn cancel(&self) -> bool {
        if self
            .inner
            .state
            .compare_exchange(
                TIMEOUT_PENDING,
                TIMEOUT_CANCELLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        self.inner.pending.fetch_sub(1, Ordering::AcqRel);
        self.inner.task.lock().take();
        true
    }

    pub fn is_pending(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == TIMEOUT_PENDING
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == TIMEOUT_CANCELLED
    }

    pub fn is_expired(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == TIMEOUT_EXPIRED
    }

    fn expire(&self) -> Option<TimerTask> {
        self.inner
            .state
            .compare_exchange(
                TIMEOUT_PENDING,
                TIMEOUT_EXPIRED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()?;
        self.inner.pending.fetch_sub(1, Ordering::AcqRel);
        self.inner.task.lock().take()
    }
}

impl PartialEq for Timeout {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Timeout {}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.state.load(Ordering::Acquire) {
            TIMEOUT_PENDING => "pending",
            TIMEOUT_CANCELLED => "cancelled",
            _ => "expired",
        };
        f.debug_struct("Timeout")
            .field("id", &self.inner.id)
            .field("deadline_ms", &self.inner.deadline.as_millis())
            .field("state", &state)
            .finish()
    }
}

/// A timeout parked in a bucket together with the number of additional
/// revolutions that must pass before it is due.
struct Slot {
    timeout: Timeout,
    remaining_rounds: u64,
}

struct Shared {
    state: AtomicU8,
    started_at: Instant,
    tick: Duration,
    mask: u64,
    incoming: Mutex<Vec<Timeout>>,
    pending: Arc<AtomicUsize>,
    next_id: AtomicU64,
    executor: Arc<dyn TaskExecutor>,
}

impl Shared {
    fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == WHEEL_STARTED
    }
}

/// Hashed timing wheel.
///
/// `N` buckets (rounded up to a power of two) are swept by a dedicated thread,
/// one bucket per tick. A timeout lands in bucket `(tick + delay / tick) mod N`
/// and carries a round counter for delays longer than one revolution.
pub struct TimingWheel {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<Vec<Timeout>>>>,
}

impl TimingWheel {
    /// Create a wheel and start its tick thread.
    pub fn new(
        executor: Arc<dyn TaskExecutor>,
        tick: Duration,
        ticks_per_wheel: usize,
    ) -> Result<Self> {
        if tick.is_zero() {
            return Err(SchedulerError::Config("wheel tick must be > 0".into()));
        }
        if ticks_per_wheel == 0 || ticks_per_wheel > (1 << 30) {
            return Err(SchedulerError::Config(
                "ticks_per_wheel must be in 1..=2^30".into(),
            ));
        }
        let size = ticks_per_wheel.next_power_of_two();

        let shared = Arc::new(Shared {
            state: AtomicU8::new(WHEEL_STARTED),
            started_at: Instant::now(),
            tick,
            mask: (size - 1) as u64,
            incoming: Mutex::new(Vec::new()),
            pending: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(1),
            executor,
        });

        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("timing-wheel".to_string())
            .spawn(move || Worker::new(worker_shared, size).run())?;

        tracing::debug!(tick_ms = tick.as_millis() as u64, buckets = size, "Timing wheel started");

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Schedule `task` to run once `delay` has elapsed.
    ///
    /// A timeout accepted here is either run, cancelled or returned by
    /// [`stop`](Self::stop), even when the two calls race.
    pub fn new_timeout<F>(&self, task: F, delay: Duration) -> Result<Timeout>
    where
        F: FnOnce(&Timeout) + Send + 'static,
    {
        // Checked under the queue lock: `stop` drains the queue after flipping
        // the state, so a push seen as running always lands before that drain.
        let mut incoming = self.shared.incoming.lock();
        if !self.shared.is_running() {
            return Err(SchedulerError::TimerStopped);
        }
        let deadline = self.shared.started_at.elapsed().saturating_add(delay);
        let task: TimerTask = Box::new(task);
        let timeout = Timeout {
            inner: Arc::new(TimeoutInner {
                id: self.shared.next_id.fetch_add(1, Ordering::Relaxed),
                deadline,
                started_at: self.shared.started_at,
                state: AtomicU8::new(TIMEOUT_PENDING),
                task: Mutex::new(Some(task)),
                pending: self.shared.pending.clone(),
            }),
        };
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        incoming.push(timeout.clone());
        Ok(timeout)
    }

    /// Number of timeouts neither expired nor cancelled.
    pub fn pending_timeouts(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        !self.shared.is_running()
    }

    /// Halt the tick thread and return every timeout that never expired and was
    /// never cancelled. A second call returns an empty set.
    pub fn stop(&self) -> Vec<Timeout> {
        if self
            .shared
            .state
            .compare_exchange(
                WHEEL_STARTED,
                WHEEL_SHUTDOWN,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Vec::new();
        }

        let Some(handle) = self.worker.lock().take() else {
            return Vec::new();
        };
        if handle.thread().id() == thread::current().id() {
            tracing::error!("TimingWheel::stop called from the tick thread");
            return Vec::new();
        }
        handle.thread().unpark();

        let mut unprocessed = match handle.join() {
            Ok(left) => left,
            Err(_) => {
                tracing::error!("Timing wheel tick thread panicked");
                Vec::new()
            }
        };
        unprocessed.extend(
            self.shared
                .incoming
                .lock()
                .drain(..)
                .filter(|t| t.is_pending()),
        );
        tracing::debug!(unprocessed = unprocessed.len(), "Timing wheel stopped");
        unprocessed
    }
}

impl Drop for TimingWheel {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for TimingWheel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimingWheel")
            .field("tick", &self.shared.tick)
            .field("buckets", &(self.shared.mask + 1))
            .field("pending", &self.pending_timeouts())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// State owned exclusively by the tick thread.
struct Worker {
    shared: Arc<Shared>,
    buckets: Vec<Vec<Slot>>,
    tick: u64,
}

impl Worker {
    fn new(shared: Arc<Shared>, size: usize) -> Self {
        Self {
            shared,
            buckets: (0..size).map(|_| Vec::new()).collect(),
            tick: 0,
        }
    }

    fn run(mut self) -> Vec<Timeout> {
        while self.shared.is_running() {
            let Some(now) = self.wait_for_next_tick() else {
                break;
            };
            self.transfer_incoming();
            let idx = (self.tick & self.shared.mask) as usize;
            self.expire_bucket(idx, now);
            self.tick = self.tick.wrapping_add(1);
        }

        self.buckets
            .into_iter()
            .flatten()
            .map(|slot| slot.timeout)
            .filter(Timeout::is_pending)
            .collect()
    }

    /// Sleep until the current tick's deadline. Returns elapsed time since
    /// start, or `None` once the wheel is shutting down.
    fn wait_for_next_tick(&self) -> Option<Duration> {
        let nanos = self
            .shared
            .tick
            .as_nanos()
            .saturating_mul(u128::from(self.tick) + 1);
        let deadline = Duration::from_nanos(nanos.min(u128::from(u64::MAX)) as u64);
        loop {
            if !self.shared.is_running() {
                return None;
            }
            let elapsed = self.shared.started_at.elapsed();
            if elapsed >= deadline {
                return Some(elapsed);
            }
            thread::park_timeout(deadline - elapsed);
        }
    }

    fn transfer_incoming(&mut self) {
        let batch: Vec<Timeout> = {
            let mut incoming = self.shared.incoming.lock();
            let take = incoming.len().min(MAX_TRANSFER_PER_TICK);
            incoming.drain(..take).collect()
        };

        let tick_nanos = self.shared.tick.as_nanos().max(1);
        let wheel_len = self.buckets.len() as u64;
        for timeout in batch {
            if !timeout.is_pending() {
                continue;
            }
            let calculated = (timeout.inner.deadline.as_nanos() / tick_nanos) as u64;
            let remaining_rounds = calculated.saturating_sub(self.tick) / wheel_len;
            // Already-late timeouts go into the current bucket.
            let ticks = calculated.max(self.tick);
            let idx = (ticks & self.shared.mask) as usize;
            self.buckets[idx].push(Slot {
                timeout,
                remaining_rounds,
            });
        }
    }

    fn expire_bucket(&mut self, idx: usize, now: Duration) {
        let shared = &self.shared;
        self.buckets[idx].retain_mut(|slot| {
            if !slot.timeout.is_pending() {
                return false;
            }
            if slot.remaining_rounds > 0 {
                slot.remaining_rounds -= 1;
                return true;
            }
            if slot.timeout.inner.deadline > now || !shared.is_running() {
                return true;
            }
            if let Some(task) = slot.timeout.expire() {
                dispatch(shared.executor.as_ref(), slot.timeout.clone(), task);
            }
            false
        });
    }
}

fn dispatch(executor: &dyn TaskExecutor, timeout: Timeout, task: TimerTask) {
    let id = timeout.id();
    let job = Box::new(move || {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| task(&timeout))) {
            tracing::warn!(
                timeout_id = timeout.id(),
                panic = panic_message(panic.as_ref()),
                "Timer task panicked"
            );
        }
    });
    if catch_unwind(AssertUnwindSafe(|| executor.execute(job))).is_err() {
        tracing::error!(timeout_id = id, "Timer task could not be handed to its executor");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}
