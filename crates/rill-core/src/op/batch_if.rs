//! Control-gated batching.
//!
//! [`Connection::batch_if`] holds upstream batches while a boolean control
//! feed reads `true` and releases them as one coalesced net batch when it
//! flips back to `false`. While unpaused, batches pass through one-to-one.

use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::change::ChangeSet;
use crate::connect::{Connection, Observer, Slot, StreamFault, Subscription};
use crate::feed::{FeedConnection, ValueObserver};

impl<K, V> Connection<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Gates batching on a boolean control feed.
    ///
    /// The gate starts open (not paused). `true` pauses: upstream batches
    /// buffer and nothing flows downstream. `false` resumes: the buffered
    /// batches coalesce into one net batch, emitted only if something nets
    /// out; pausing again flushes nothing. Pending batches are discarded if
    /// the upstream completes or the subscription is disposed while paused.
    /// Control completion freezes the gate in its current state.
    ///
    /// Downstream callbacks must not push to `control`; delivery runs
    /// under the gate lock.
    #[must_use]
    pub fn batch_if(self, control: FeedConnection<bool>) -> Connection<K, V> {
        Connection::from_subscribe(move |down: Slot<K, V>| {
            let gate = Arc::new(Mutex::new(GateState {
                paused: false,
                pending: Vec::new(),
            }));

            let control_sub = control.subscribe(GateControl {
                gate: Arc::clone(&gate),
                down: down.clone(),
            });
            let up_sub = self.subscribe(GateObserver {
                gate,
                down: down.clone(),
            });

            let closer = down;
            Subscription::new(move || {
                up_sub.dispose();
                control_sub.dispose();
                closer.close();
            })
        })
    }
}

struct GateState<K, V> {
    paused: bool,
    pending: Vec<ChangeSet<K, V>>,
}

/// Upstream side: buffers while paused, passes through otherwise.
struct GateObserver<K, V> {
    gate: Arc<Mutex<GateState<K, V>>>,
    down: Slot<K, V>,
}

impl<K, V> Observer<K, V> for GateObserver<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    fn on_changes(&mut self, changes: &ChangeSet<K, V>) {
        // Delivery stays under the gate lock so a concurrent resume cannot
        // reorder a pass-through batch against the flush.
        let mut gate = self.gate.lock();
        if gate.paused {
            gate.pending.push(changes.clone());
        } else {
            self.down.deliver(changes);
        }
    }

    fn on_fault(&mut self, fault: &StreamFault) {
        self.gate.lock().pending.clear();
        self.down.fault(fault);
    }

    fn on_completed(&mut self) {
        self.gate.lock().pending.clear();
        self.down.complete();
    }
}

/// Control side: flips the gate and flushes on resume.
struct GateControl<K, V> {
    gate: Arc<Mutex<GateState<K, V>>>,
    down: Slot<K, V>,
}

impl<K, V> ValueObserver<bool> for GateControl<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    fn on_value(&mut self, pause: &bool) {
        let mut gate = self.gate.lock();
        if *pause {
            gate.paused = true;
            return;
        }
        if !gate.paused {
            return;
        }
        gate.paused = false;
        let pending = std::mem::take(&mut gate.pending);
        let net = ChangeSet::coalesce(pending);
        if !net.is_empty() {
            self.down.deliver(&net);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
