//! Time-interval batching.
//!
//! [`Connection::buffer`] holds upstream batches and releases them on a
//! fixed clock interval as one coalesced net batch. A window with nothing
//! buffered schedules nothing, so an idle stream costs no timer.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::change::ChangeSet;
use crate::clock::{Clock, ScheduleHandle};
use crate::connect::{Connection, Observer, Slot, StreamFault, Subscription};

impl<K, V> Connection<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Buffers batches and emits the net effect of each time window.
    ///
    /// The first batch after an idle stretch arms a flush `interval`
    /// later; everything arriving before the flush coalesces into one net
    /// batch, suppressed entirely if nothing nets out. Completion flushes
    /// whatever is buffered before completing; disposal and faults
    /// discard it.
    #[must_use]
    pub fn buffer(self, interval: Duration, clock: Arc<dyn Clock>) -> Connection<K, V> {
        Connection::from_subscribe(move |down: Slot<K, V>| {
            let state = Arc::new(Mutex::new(BufferState {
                pending: Vec::new(),
                flush: None,
            }));
            let up_sub = self.subscribe(BufferObserver {
                interval,
                clock,
                state: Arc::clone(&state),
                down: down.clone(),
            });
            let closer = down;
            Subscription::new(move || {
                {
                    let mut state = state.lock();
                    state.pending.clear();
                    if let Some(handle) = state.flush.take() {
                        handle.cancel();
                    }
                }
                up_sub.dispose();
                closer.close();
            })
        })
    }
}

struct BufferState<K, V> {
    pending: Vec<ChangeSet<K, V>>,
    flush: Option<ScheduleHandle>,
}

struct BufferObserver<K, V> {
    interval: Duration,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<BufferState<K, V>>>,
    down: Slot<K, V>,
}

impl<K, V> Observer<K, V> for BufferObserver<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    fn on_changes(&mut self, changes: &ChangeSet<K, V>) {
        let mut state = self.state.lock();
        state.pending.push(changes.clone());
        if state.flush.is_none() {
            let flush_state = Arc::clone(&self.state);
            let down = self.down.clone();
            state.flush = Some(self.clock.schedule(
                self.interval,
                Box::new(move || run_flush(&flush_state, &down)),
            ));
        }
    }

    fn on_fault(&mut self, fault: &StreamFault) {
        {
            let mut state = self.state.lock();
            state.pending.clear();
            if let Some(handle) = state.flush.take() {
                handle.cancel();
            }
        }
        self.down.fault(fault);
    }

    fn on_completed(&mut self) {
        let net = {
            let mut state = self.state.lock();
            if let Some(handle) = state.flush.take() {
                handle.cancel();
            }
            ChangeSet::coalesce(std::mem::take(&mut state.pending))
        };
        if !net.is_empty() {
            self.down.deliver(&net);
        }
        self.down.complete();
    }
}

/// One window flush, on the clock's thread.
fn run_flush<K, V>(state: &Arc<Mutex<BufferState<K, V>>>, down: &Slot<K, V>)
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    let net = {
        let mut state = state.lock();
        state.flush = None;
        ChangeSet::coalesce(std::mem::take(&mut state.pending))
    };
    // The state lock is released before delivery so a downstream callback
    // may dispose its own subscription.
    if !net.is_empty() {
        down.deliver(&net);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
