//! Timeout scheduler
//!
//! A single background thread runs one-shot deferred callbacks in due-time
//! order. Registration and cancellation are safe from any thread, including
//! from inside a running callback. The worker sleeps until the earliest due
//! time but never longer than the poll interval, so a callback fires at most
//! one poll interval after it is due.
//!
//! The scheduler is an explicit object: whoever needs deferred work holds an
//! `Arc<Kernel>` and owns its lifecycle.
//!
//! Join boundary: [`Kernel::stop`] wakes the worker and joins it, so a
//! callback that is already executing runs to completion before `stop`
//! returns. `stop` called from inside a callback cannot join its own thread;
//! it only flags the worker, which exits once the callback returns.
//!
//! [`Kernel::shutdown`] is a terminal stop: afterwards the worker never
//! starts again and new timeouts are dropped, including ones registered by a
//! callback that was still running when shutdown began.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, trace};

/// Default worker poll interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Scheduler lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KernelState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
}

impl KernelState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => KernelState::Starting,
            2 => KernelState::Running,
            _ => KernelState::Stopped,
        }
    }
}

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Pending callbacks ordered by due time, then registration order
type PendingSet = BTreeMap<(Instant, u64), Callback>;

/// One scheduled callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutHandle {
    id: u64,
    registered_at: Instant,
    due: Instant,
}

impl TimeoutHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn registered_at(&self) -> Instant {
        self.registered_at
    }

    pub fn due(&self) -> Instant {
        self.due
    }

    fn key(&self) -> (Instant, u64) {
        (self.due, self.id)
    }
}

struct Shared {
    state: AtomicU8,
    /// Set once by `shutdown`; written under the pending lock
    closed: AtomicBool,
    /// Bumped on every start; a worker from an earlier generation exits
    generation: AtomicU64,
    pending: Mutex<PendingSet>,
    wake: Condvar,
    poll_interval: Duration,
    fired: AtomicU64,
    panicked: AtomicU64,
}

impl Shared {
    fn state(&self) -> KernelState {
        KernelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn should_run(&self, generation: u64) -> bool {
        self.state() == KernelState::Running && self.generation.load(Ordering::Acquire) == generation
    }
}

/// Background timeout scheduler
pub struct Kernel {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Kernel {
    /// Create a stopped scheduler; it starts on first use
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(KernelState::Stopped as u8),
                closed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                pending: Mutex::new(BTreeMap::new()),
                wake: Condvar::new(),
                poll_interval: poll_interval.max(Duration::from_millis(1)),
                fired: AtomicU64::new(0),
                panicked: AtomicU64::new(0),
            }),
            next_id: AtomicU64::new(1),
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> KernelState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == KernelState::Running
    }

    pub fn poll_interval(&self) -> Duration {
        self.shared.poll_interval
    }

    /// Whether `shutdown` has been called
    pub fn is_shut_down(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Start the worker; no-op if already started or shut down
    pub fn start(&self) {
        if self.is_shut_down() {
            return;
        }
        if self
            .shared
            .state
            .compare_exchange(
                KernelState::Stopped as u8,
                KernelState::Starting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        let mut worker = self.worker.lock();
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.state.store(KernelState::Running as u8, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("idlesync-kernel".to_string())
            .spawn(move || run_worker(shared, generation));

        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                info!(
                    poll_interval_ms = self.shared.poll_interval.as_millis() as u64,
                    "Kernel started"
                );
            }
            Err(e) => {
                self.shared.state.store(KernelState::Stopped as u8, Ordering::Release);
                error!(error = %e, "Failed to spawn kernel worker");
            }
        }
    }

    /// Stop the worker and wait for it to exit
    ///
    /// Pending timeouts are kept and run after the next start.
    pub fn stop(&self) {
        let previous = self.shared.state.swap(KernelState::Stopped as u8, Ordering::AcqRel);
        if KernelState::from_u8(previous) == KernelState::Stopped {
            return;
        }

        {
            let _pending = self.shared.pending.lock();
            self.shared.wake.notify_all();
        }

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                debug!("Kernel stop requested from its own worker");
                return;
            }
            if handle.join().is_err() {
                error!("Kernel worker terminated abnormally");
            }
        }
        info!(pending = self.pending_count(), "Kernel stopped");
    }

    /// Stop for good and drop every pending timeout
    pub fn shutdown(&self) {
        // Callbacks are dropped outside the lock; they may own the last Kernel reference
        let dropped = {
            let mut pending = self.shared.pending.lock();
            self.shared.closed.store(true, Ordering::Release);
            std::mem::take(&mut *pending)
        };
        self.stop();
        debug!(dropped = dropped.len(), "Kernel shut down");
    }

    /// Run `callback` once after `delay`, starting the worker if needed
    ///
    /// After [`Kernel::shutdown`] the callback is dropped without running.
    pub fn set_timeout<F>(&self, delay: Duration, callback: F) -> TimeoutHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.start();

        let registered_at = Instant::now();
        let handle = TimeoutHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            registered_at,
            due: registered_at + delay,
        };

        let mut pending = self.shared.pending.lock();
        if self.shared.closed.load(Ordering::Acquire) {
            trace!(timeout_id = handle.id, "Kernel shut down, timeout dropped");
            return handle;
        }
        pending.insert(handle.key(), Box::new(callback));
        self.shared.wake.notify_one();
        drop(pending);

        trace!(timeout_id = handle.id, delay_ms = delay.as_millis() as u64, "Timeout scheduled");
        handle
    }

    /// Cancel a pending timeout; false if it already fired or was cleared
    pub fn clear_timeout(&self, handle: &TimeoutHandle) -> bool {
        let removed = self.shared.pending.lock().remove(&handle.key()).is_some();
        if removed {
            trace!(timeout_id = handle.id, "Timeout cleared");
        }
        removed
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Callbacks that ran to completion
    pub fn fired_count(&self) -> u64 {
        self.shared.fired.load(Ordering::Relaxed)
    }

    /// Callbacks that panicked
    pub fn panicked_count(&self) -> u64 {
        self.shared.panicked.load(Ordering::Relaxed)
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("state", &self.state())
            .field("poll_interval", &self.shared.poll_interval)
            .field("pending", &self.pending_count())
            .finish()
    }
}

fn run_worker(shared: Arc<Shared>, generation: u64) {
    debug!(generation, "Kernel worker running");
    let mut pending = shared.pending.lock();

    while shared.should_run(generation) {
        let now = Instant::now();
        let next_due = pending.keys().next().map(|(due, _)| *due);

        match next_due {
            Some(due) if due <= now => {
                if let Some(((_, id), callback)) = pending.pop_first() {
                    // Callbacks may schedule or clear timeouts
                    MutexGuard::unlocked(&mut pending, || fire(&shared, id, callback));
                }
            }
            Some(due) => {
                let wait = (due - now).min(shared.poll_interval);
                shared.wake.wait_for(&mut pending, wait);
            }
            None => {
                shared.wake.wait_for(&mut pending, shared.poll_interval);
            }
        }
    }

    debug!(generation, "Kernel worker exiting");
}

fn fire(shared: &Shared, id: u64, callback: Callback) {
    match panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(()) => {
            shared.fired.fetch_add(1, Ordering::Relaxed);
            trace!(timeout_id = id, "Timeout fired");
        }
        Err(payload) => {
            shared.panicked.fetch_add(1, Ordering::Relaxed);
            error!(timeout_id = id, panic = %panic_message(payload.as_ref()), "Timeout callback panicked");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
