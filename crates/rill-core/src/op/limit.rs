//! Bounded-size eviction.
//!
//! Caps a cache at a fixed number of entries. Mutations do not evict
//! inline; the evictor samples on a short coalescing clock tick, so a burst
//! of writes costs one eviction pass. Victims are chosen oldest-first by
//! the sequence of their last add-or-update, removed from the cache as one
//! batch (every cache connection sees the Removes), and the Removes the
//! cache actually applied are forwarded on the evictor's own connection.

use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::cache::CacheInner;
use crate::change::{Change, ChangeSet};
use crate::clock::{Clock, ScheduleHandle};
use crate::connect::{Connection, Observer, Slot, StreamFault, Subscription};
use crate::Error;

/// Delay between an observed mutation and the eviction pass it triggers.
const EVICT_INTERVAL: Duration = Duration::from_millis(10);

/// Builds the eviction connection for [`SourceCache::limit_size_to`].
///
/// [`SourceCache::limit_size_to`]: crate::cache::SourceCache::limit_size_to
pub(crate) fn limit_size_to<K, V>(
    inner: &Arc<CacheInner<K, V>>,
    limit: usize,
    clock: Arc<dyn Clock>,
) -> crate::Result<Connection<K, V>>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    if limit == 0 {
        return Err(Error::InvalidLimit { limit });
    }
    let cache = Arc::downgrade(inner);
    let upstream = CacheInner::connect_with(inner, None);
    Ok(Connection::from_subscribe(move |down: Slot<K, V>| {
        let state = Arc::new(Mutex::new(LimitState {
            seq: 0,
            order: FxHashMap::default(),
            pending: None,
        }));
        let up_sub = upstream.subscribe(EvictObserver {
            limit,
            clock,
            cache,
            state: Arc::clone(&state),
            down: down.clone(),
        });
        let closer = down;
        Subscription::new(move || {
            if let Some(handle) = state.lock().pending.take() {
                handle.cancel();
            }
            up_sub.dispose();
            closer.close();
        })
    }))
}

struct LimitState<K> {
    seq: u64,
    /// Sequence of the last add-or-update per present key.
    order: FxHashMap<K, u64>,
    pending: Option<ScheduleHandle>,
}

struct EvictObserver<K, V> {
    limit: usize,
    clock: Arc<dyn Clock>,
    cache: Weak<CacheInner<K, V>>,
    state: Arc<Mutex<LimitState<K>>>,
    down: Slot<K, V>,
}

impl<K, V> Observer<K, V> for EvictObserver<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    fn on_changes(&mut self, changes: &ChangeSet<K, V>) {
        let mut state = self.state.lock();
        for change in changes {
            match change {
                Change::Add { key, .. } | Change::Update { key, .. } => {
                    state.seq += 1;
                    let seq = state.seq;
                    state.order.insert(key.clone(), seq);
                }
                Change::Remove { key, .. } => {
                    state.order.remove(key);
                }
                Change::Refresh { .. } => {}
            }
        }
        if state.order.len() > self.limit && state.pending.is_none() {
            let tick_state = Arc::clone(&self.state);
            let cache = self.cache.clone();
            let down = self.down.clone();
            let limit = self.limit;
            state.pending = Some(self.clock.schedule(
                EVICT_INTERVAL,
                Box::new(move || run_tick(&tick_state, &cache, limit, &down)),
            ));
        }
    }

    fn on_fault(&mut self, fault: &StreamFault) {
        if let Some(handle) = self.state.lock().pending.take() {
            handle.cancel();
        }
        self.down.fault(fault);
    }

    fn on_completed(&mut self) {
        if let Some(handle) = self.state.lock().pending.take() {
            handle.cancel();
        }
        self.down.complete();
    }
}

/// One eviction pass, on the clock's thread.
fn run_tick<K, V>(
    state: &Arc<Mutex<LimitState<K>>>,
    cache: &Weak<CacheInner<K, V>>,
    limit: usize,
    down: &Slot<K, V>,
) where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    let victims = {
        let mut state = state.lock();
        state.pending = None;
        if state.order.len() <= limit {
            return;
        }
        let excess = state.order.len() - limit;
        let mut by_age: Vec<(u64, K)> = state
            .order
            .iter()
            .map(|(key, seq)| (*seq, key.clone()))
            .collect();
        by_age.sort_by_key(|(seq, _)| *seq);
        by_age.into_iter().take(excess).map(|(_, key)| key).collect::<Vec<K>>()
    };

    // The removal publishes back through this observer, which keeps the
    // order map consistent; the state lock must be free by then. The
    // downstream batch is the one the cache actually applied, so a key
    // that left the cache between victim selection and removal cannot be
    // reported with a stale value.
    if let Some(cache) = cache.upgrade() {
        let batch = cache.remove_keys(&victims);
        if !batch.is_empty() {
            tracing::trace!(evicted = batch.removes(), limit, "size cap eviction");
            down.deliver(&batch);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
