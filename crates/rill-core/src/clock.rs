//! Time capability.
//!
//! Operators that need time take a [`Clock`] rather than reading the system
//! clock directly. [`SystemClock`] fires callbacks on real time for
//! production use; [`VirtualClock`] only advances when told to, so tests
//! drive eviction and similar timed behavior deterministically.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fxhash::FxHashMap;
use parking_lot::Mutex;

/// A deferred callback.
pub type ClockCallback = Box<dyn FnOnce() + Send>;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of the current time and of deferred execution.
///
/// `now` is monotone relative to an arbitrary origin. A scheduled callback
/// runs at most once; cancelling its handle before it fires suppresses it.
pub trait Clock: Send + Sync {
    /// Elapsed time since the clock's origin.
    fn now(&self) -> Duration;

    /// Runs `callback` once after `delay` has elapsed.
    fn schedule(&self, delay: Duration, callback: ClockCallback) -> ScheduleHandle;
}

/// Cancellation handle for a scheduled callback.
///
/// Dropping the handle does not cancel; call [`ScheduleHandle::cancel`].
#[derive(Debug, Clone)]
pub struct ScheduleHandle {
    cancelled: Arc<AtomicBool>,
}

impl ScheduleHandle {
    fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Prevents the callback from running if it has not fired yet.
    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// SystemClock
// ---------------------------------------------------------------------------

/// Wall-time clock firing callbacks on a background thread per schedule.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Creates a clock whose origin is the moment of construction.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn schedule(&self, delay: Duration, callback: ClockCallback) -> ScheduleHandle {
        let handle = ScheduleHandle::new();
        let fired = handle.clone();
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            if !fired.is_cancelled() {
                callback();
            }
        });
        handle
    }
}

// ---------------------------------------------------------------------------
// VirtualClock
// ---------------------------------------------------------------------------

/// Manually driven clock for deterministic tests.
///
/// Callbacks fire synchronously inside [`VirtualClock::advance_by`] /
/// [`advance_to`](VirtualClock::advance_to), on the advancing thread, in due
/// order (ties fire in schedule order). A firing callback may schedule
/// further callbacks; those fire too if they fall within the advanced range.
pub struct VirtualClock {
    state: Mutex<VirtualState>,
}

struct VirtualState {
    now: Duration,
    next_id: u64,
    due: BinaryHeap<Due>,
    callbacks: FxHashMap<u64, (ClockCallback, ScheduleHandle)>,
}

/// Heap entry ordered soonest-first.
struct Due {
    at: Duration,
    id: u64,
}

impl PartialEq for Due {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.id == other.id
    }
}

impl Eq for Due {}

impl PartialOrd for Due {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Due {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the BinaryHeap pops the earliest deadline first.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl VirtualClock {
    /// Creates a clock at time zero with nothing scheduled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(VirtualState {
                now: Duration::ZERO,
                next_id: 0,
                due: BinaryHeap::new(),
                callbacks: FxHashMap::default(),
            }),
        }
    }

    /// Advances by `delta`, firing everything due on the way.
    pub fn advance_by(&self, delta: Duration) {
        let target = self.state.lock().now + delta;
        self.advance_to(target);
    }

    /// Advances to `target`, firing everything due on the way.
    ///
    /// A target earlier than the current time leaves the clock unchanged.
    pub fn advance_to(&self, target: Duration) {
        loop {
            // Pop one due entry under the lock, then run it outside so the
            // callback can schedule or cancel without deadlocking.
            let next = {
                let mut state = self.state.lock();
                if target < state.now {
                    return;
                }
                let head_due = state.due.peek().map_or(false, |due| due.at <= target);
                if !head_due {
                    state.now = target;
                    return;
                }
                match state.due.pop() {
                    Some(due) => {
                        state.now = state.now.max(due.at);
                        state.callbacks.remove(&due.id)
                    }
                    None => None,
                }
            };
            if let Some((callback, handle)) = next {
                if !handle.is_cancelled() {
                    callback();
                }
            }
        }
    }

    /// Number of callbacks still waiting to fire.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.lock().callbacks.len()
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Duration {
        self.state.lock().now
    }

    fn schedule(&self, delay: Duration, callback: ClockCallback) -> ScheduleHandle {
        let handle = ScheduleHandle::new();
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        let at = state.now + delay;
        state.due.push(Due { at, id });
        state.callbacks.insert(id, (callback, handle.clone()));
        handle
    }
}

impl std::fmt::Debug for VirtualClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("VirtualClock")
            .field("now", &state.now)
            .field("pending", &state.callbacks.len())
            .finish()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
