//! Source cache — the authoritative keyed collection.
//!
//! A [`SourceCache`] owns a key→value map and is the only place mutations
//! enter the system. Every mutation runs as an edit transaction producing
//! one net [`ChangeSet`], applied to the map and delivered to every open
//! connection before the next mutation may begin. Consequently the cache's
//! contents always equal the fold of every batch a connection has observed.

mod edit;

pub use edit::Editor;

use std::convert::Infallible;
use std::hash::Hash;
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::change::{Change, ChangeSet};
use crate::clock::Clock;
use crate::connect::{Connection, Slot, Subscription};

/// Shared connection predicate.
pub(crate) type Filter<K, V> = Arc<dyn Fn(&K, &V) -> bool + Send + Sync>;

// ---------------------------------------------------------------------------
// Cache internals
// ---------------------------------------------------------------------------

pub(crate) struct CacheInner<K, V> {
    key_of: Box<dyn Fn(&V) -> K + Send + Sync>,
    /// Serializes mutation plus delivery, and connection registration.
    publish: Mutex<()>,
    state: Mutex<CacheState<K, V>>,
}

struct CacheState<K, V> {
    entries: FxHashMap<K, V>,
    connections: Vec<ConnectionSlot<K, V>>,
    next_connection: u64,
    disposed: bool,
}

struct ConnectionSlot<K, V> {
    id: u64,
    filter: Option<Filter<K, V>>,
    slot: Slot<K, V>,
}

impl<K, V> CacheInner<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Runs one edit transaction: stage, commit, deliver.
    ///
    /// Returns the net batch that was applied (empty if the edit netted
    /// out to nothing). Observers are invoked after the state lock is
    /// released, so a callback may dispose its own subscription; it must
    /// not call back into this cache (the publish lock is still held).
    pub(crate) fn edit_inner<E, F>(&self, f: F) -> Result<ChangeSet<K, V>, E>
    where
        F: FnOnce(&mut Editor<'_, K, V>) -> Result<(), E>,
    {
        let _publish = self.publish.lock();
        let mut state = self.state.lock();
        if state.disposed {
            return Ok(ChangeSet::new());
        }
        let net = {
            let mut editor = Editor::new(&state.entries, self.key_of.as_ref());
            f(&mut editor)?;
            editor.into_net()
        };
        if net.is_empty() {
            return Ok(net);
        }
        net.apply_to(&mut state.entries);
        let sinks: Vec<(Option<Filter<K, V>>, Slot<K, V>)> = state
            .connections
            .iter()
            .map(|c| (c.filter.clone(), c.slot.clone()))
            .collect();
        drop(state);

        for (filter, slot) in sinks {
            match filter {
                Some(predicate) => {
                    let narrowed = net.filtered(|k, v| predicate(k, v));
                    if !narrowed.is_empty() {
                        slot.deliver(&narrowed);
                    }
                }
                None => slot.deliver(&net),
            }
        }
        Ok(net)
    }

    /// Removes a set of keys as one batch, returning the Removes actually
    /// applied (keys already gone drop out silently). Used by the evictor.
    pub(crate) fn remove_keys(&self, keys: &[K]) -> ChangeSet<K, V> {
        let result: Result<ChangeSet<K, V>, Infallible> = self.edit_inner(|editor| {
            for key in keys {
                editor.remove(key);
            }
            Ok(())
        });
        match result {
            Ok(net) => net,
            Err(e) => match e {},
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Registers a connection with an optional predicate.
    pub(crate) fn connect_with(inner: &Arc<Self>, filter: Option<Filter<K, V>>) -> Connection<K, V> {
        let inner = Arc::clone(inner);
        Connection::from_subscribe(move |slot| {
            let _publish = inner.publish.lock();
            let registered = {
                let mut state = inner.state.lock();
                if state.disposed {
                    None
                } else {
                    let id = state.next_connection;
                    state.next_connection += 1;
                    state.connections.push(ConnectionSlot {
                        id,
                        filter: filter.clone(),
                        slot: slot.clone(),
                    });
                    let mut initial = ChangeSet::new();
                    for (key, value) in &state.entries {
                        if filter.as_ref().map_or(true, |p| p(key, value)) {
                            initial.push(Change::Add {
                                key: key.clone(),
                                current: value.clone(),
                            });
                        }
                    }
                    Some((id, initial))
                }
            };
            match registered {
                None => {
                    slot.complete();
                    Subscription::empty()
                }
                Some((id, initial)) => {
                    if !initial.is_empty() {
                        slot.deliver(&initial);
                    }
                    let weak = Arc::downgrade(&inner);
                    Subscription::new(move || {
                        if let Some(strong) = weak.upgrade() {
                            strong.state.lock().connections.retain(|c| c.id != id);
                        }
                        slot.close();
                    })
                }
            }
        })
    }

}

impl<K, V> CacheInner<K, V> {
    /// Marks the cache disposed and completes every open connection.
    fn dispose(&self) {
        let _publish = self.publish.lock();
        let connections = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.entries.clear();
            std::mem::take(&mut state.connections)
        };
        for connection in connections {
            connection.slot.complete();
        }
    }
}

// ---------------------------------------------------------------------------
// SourceCache
// ---------------------------------------------------------------------------

/// An in-memory keyed collection emitting one net batch per mutation.
///
/// Construct with a key selector; values carry their own identity. Every
/// public mutation is a single-op edit transaction; [`SourceCache::edit`]
/// groups several mutations into one atomic batch.
///
/// ```
/// use rill_core::SourceCache;
///
/// let cache: SourceCache<u64, (u64, &str)> = SourceCache::new(|v: &(u64, &str)| v.0);
/// cache.add_or_update((1, "one"));
/// assert_eq!(cache.len(), 1);
/// ```
pub struct SourceCache<K, V> {
    inner: Arc<CacheInner<K, V>>,
}

impl<K, V> SourceCache<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Creates an empty cache keyed by `key_of`.
    #[must_use]
    pub fn new(key_of: impl Fn(&V) -> K + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                key_of: Box::new(key_of),
                publish: Mutex::new(()),
                state: Mutex::new(CacheState {
                    entries: FxHashMap::default(),
                    connections: Vec::new(),
                    next_connection: 0,
                    disposed: false,
                }),
            }),
        }
    }

    /// Runs several mutations as one atomic transaction.
    ///
    /// The staged mutations coalesce into a single net batch; if nothing
    /// nets out, no batch is emitted. Returning an error from the closure
    /// aborts the whole edit and leaves the cache untouched.
    pub fn edit<E, F>(&self, f: F) -> Result<(), E>
    where
        F: FnOnce(&mut Editor<'_, K, V>) -> Result<(), E>,
    {
        self.inner.edit_inner(f).map(|_| ())
    }

    /// Inserts or replaces one value.
    pub fn add_or_update(&self, value: V) {
        self.mutate(|editor| editor.add_or_update(value));
    }

    /// Inserts or replaces several values as one batch.
    pub fn add_or_update_many(&self, values: impl IntoIterator<Item = V>) {
        self.mutate(|editor| {
            for value in values {
                editor.add_or_update(value);
            }
        });
    }

    /// Removes one key; absent keys are a silent no-op.
    pub fn remove(&self, key: &K) {
        self.mutate(|editor| {
            editor.remove(key);
        });
    }

    /// Removes several keys as one batch.
    pub fn remove_many<'k>(&self, keys: impl IntoIterator<Item = &'k K>)
    where
        K: 'k,
    {
        self.mutate(|editor| {
            for key in keys {
                editor.remove(key);
            }
        });
    }

    /// Signals an in-place mutation of a present key.
    pub fn refresh(&self, key: &K) {
        self.mutate(|editor| {
            editor.refresh(key);
        });
    }

    /// Removes every key as one batch.
    pub fn clear(&self) {
        self.mutate(|editor| editor.clear());
    }

    fn mutate(&self, f: impl FnOnce(&mut Editor<'_, K, V>)) {
        let result: Result<ChangeSet<K, V>, Infallible> = self.inner.edit_inner(|editor| {
            f(editor);
            Ok(())
        });
        match result {
            Ok(_) => {}
            Err(e) => match e {},
        }
    }

    /// Opens a connection observing every change.
    ///
    /// On subscribe, a non-empty cache first delivers one Add-only snapshot
    /// batch, synchronously, before any live batch.
    #[must_use]
    pub fn connect(&self) -> Connection<K, V> {
        CacheInner::connect_with(&self.inner, None)
    }

    /// Opens a connection observing only changes whose key and value pass
    /// `predicate`. Passing changes are forwarded unaltered.
    #[must_use]
    pub fn connect_filtered(
        &self,
        predicate: impl Fn(&K, &V) -> bool + Send + Sync + 'static,
    ) -> Connection<K, V> {
        CacheInner::connect_with(&self.inner, Some(Arc::new(predicate)))
    }

    /// Caps the cache at `limit` entries, evicting oldest-first on
    /// coalescing clock ticks. See [`crate::op::limit`] for mechanics.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidLimit`](crate::Error::InvalidLimit) when
    /// `limit` is zero.
    pub fn limit_size_to(
        &self,
        limit: usize,
        clock: Arc<dyn Clock>,
    ) -> crate::Result<Connection<K, V>> {
        crate::op::limit::limit_size_to(&self.inner, limit, clock)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clones the value under `key`, if present.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.state.lock().entries.get(key).cloned()
    }

    /// Clones the current key set.
    #[must_use]
    pub fn keys(&self) -> Vec<K> {
        self.inner.state.lock().entries.keys().cloned().collect()
    }

    /// Completes every open connection and releases the map.
    ///
    /// Idempotent; also runs on drop. Mutations after disposal are ignored.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl<K, V> Drop for SourceCache<K, V> {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

impl<K, V> std::fmt::Debug for SourceCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SourceCache")
            .field("len", &state.entries.len())
            .field("connections", &state.connections.len())
            .field("disposed", &state.disposed)
            .finish()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::Collector;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Person {
        name: String,
        age: u32,
    }

    fn person(name: &str, age: u32) -> Person {
        Person {
            name: name.to_string(),
            age,
        }
    }

    fn make_cache() -> SourceCache<String, Person> {
        SourceCache::new(|p: &Person| p.name.clone())
    }

    // --- Mutation and fold law ---

    #[test]
    fn contents_equal_fold_of_batches() {
        let cache = make_cache();
        let collector = Collector::new();
        let _sub = cache.connect().subscribe(collector.observer());

        cache.add_or_update(person("alice", 30));
        cache.add_or_update(person("bob", 40));
        cache.add_or_update(person("alice", 31));
        cache.remove(&"bob".to_string());

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"alice".to_string()), Some(person("alice", 31)));
        assert_eq!(collector.data(), {
            let mut m = FxHashMap::default();
            m.insert("alice".to_string(), person("alice", 31));
            m
        });
    }

    #[test]
    fn update_emits_previous_value() {
        let cache = make_cache();
        let collector = Collector::new();
        let _sub = cache.connect().subscribe(collector.observer());

        cache.add_or_update(person("alice", 30));
        cache.add_or_update(person("alice", 31));

        let batches = collector.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(
            batches[1].iter().next(),
            Some(&Change::Update {
                key: "alice".to_string(),
                current: person("alice", 31),
                previous: person("alice", 30),
            })
        );
    }

    #[test]
    fn batch_mutations_are_one_message() {
        let cache = make_cache();
        let collector = Collector::new();
        let _sub = cache.connect().subscribe(collector.observer());

        cache.add_or_update_many((0..100).map(|i| person(&format!("p{i}"), i)));

        assert_eq!(collector.batches().len(), 1);
        assert_eq!(collector.batches()[0].adds(), 100);
        assert_eq!(cache.len(), 100);
    }

    #[test]
    fn clear_emits_one_remove_per_key() {
        let cache = make_cache();
        cache.add_or_update_many([person("a", 1), person("b", 2)]);
        let collector = Collector::new();
        let _sub = cache.connect().subscribe(collector.observer());

        cache.clear();

        let batches = collector.batches();
        // Snapshot batch, then the clear batch.
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].removes(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn remove_absent_emits_nothing() {
        let cache = make_cache();
        let collector = Collector::new();
        let _sub = cache.connect().subscribe(collector.observer());

        cache.remove(&"ghost".to_string());
        assert!(collector.batches().is_empty());
    }

    // --- Edit transactions ---

    #[test]
    fn zero_net_edit_emits_no_batch() {
        let cache = make_cache();
        let collector = Collector::new();
        let _sub = cache.connect().subscribe(collector.observer());

        let result: Result<(), Infallible> = cache.edit(|editor| {
            editor.add_or_update(person("temp", 1));
            editor.remove(&"temp".to_string());
            Ok(())
        });
        assert!(result.is_ok());
        assert!(collector.batches().is_empty());
        assert!(cache.is_empty());
    }

    #[test]
    fn failed_edit_rolls_back() {
        let cache = make_cache();
        cache.add_or_update(person("alice", 30));
        let collector = Collector::new();
        let _sub = cache.connect().subscribe(collector.observer());

        let result: Result<(), &str> = cache.edit(|editor| {
            editor.add_or_update(person("bob", 40));
            editor.remove(&"alice".to_string());
            Err("validation failed")
        });

        assert_eq!(result, Err("validation failed"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"alice".to_string()), Some(person("alice", 30)));
        // Only the initial snapshot was ever delivered.
        assert_eq!(collector.batches().len(), 1);
    }

    #[test]
    fn edit_reads_staged_state() {
        let cache = make_cache();
        cache.add_or_update(person("alice", 30));

        let result: Result<(), Infallible> = cache.edit(|editor| {
            editor.add_or_update(person("bob", 40));
            assert_eq!(editor.len(), 2);
            assert!(editor.contains_key(&"bob".to_string()));
            Ok(())
        });
        assert!(result.is_ok());
        assert_eq!(cache.len(), 2);
    }

    // --- Connections ---

    #[test]
    fn late_subscriber_gets_one_snapshot_batch() {
        let cache = make_cache();
        cache.add_or_update_many([person("a", 1), person("b", 2), person("c", 3)]);

        let collector = Collector::new();
        let _sub = cache.connect().subscribe(collector.observer());

        let batches = collector.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].adds(), 3);
        assert_eq!(batches[0].len(), 3);
    }

    #[test]
    fn empty_cache_subscribe_gets_no_snapshot() {
        let cache = make_cache();
        let collector = Collector::new();
        let _sub = cache.connect().subscribe(collector.observer());
        assert!(collector.batches().is_empty());
    }

    #[test]
    fn filtered_connection_narrows_snapshot_and_live() {
        let cache = make_cache();
        cache.add_or_update_many([person("young", 20), person("old", 70)]);

        let collector = Collector::new();
        let _sub = cache
            .connect_filtered(|_, p| p.age >= 60)
            .subscribe(collector.observer());

        cache.add_or_update(person("older", 80));
        cache.add_or_update(person("kid", 10));

        let batches = collector.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].adds(), 1);
        assert_eq!(batches[0].iter().next().map(Change::key), Some(&"old".to_string()));
        assert_eq!(batches[1].iter().next().map(Change::key), Some(&"older".to_string()));
    }

    #[test]
    fn disposed_subscription_stops_delivery() {
        let cache = make_cache();
        let collector = Collector::new();
        let sub = cache.connect().subscribe(collector.observer());

        cache.add_or_update(person("a", 1));
        sub.dispose();
        cache.add_or_update(person("b", 2));

        assert_eq!(collector.batches().len(), 1);
    }

    #[test]
    fn dispose_completes_connections_once() {
        let cache = make_cache();
        let collector = Collector::new();
        let _sub = cache.connect().subscribe(collector.observer());

        cache.dispose();
        cache.dispose();
        cache.add_or_update(person("late", 1));

        assert!(collector.completed());
        assert!(collector.batches().is_empty());
        assert!(cache.is_empty());
    }

    #[test]
    fn subscribe_after_dispose_completes_immediately() {
        let cache = make_cache();
        cache.dispose();

        let collector = Collector::new();
        let _sub = cache.connect().subscribe(collector.observer());
        assert!(collector.completed());
    }

    #[test]
    fn drop_completes_connections() {
        let collector = Collector::new();
        let cache = make_cache();
        let _sub = cache.connect().subscribe(collector.observer());
        cache.add_or_update(person("a", 1));

        // The subscription outlives the cache.
        drop(cache);

        assert!(collector.completed());
        assert_eq!(collector.batches().len(), 1);
    }

    #[test]
    fn observer_may_dispose_itself_mid_callback() {
        let cache = make_cache();
        let count = Arc::new(Mutex::new(0_u32));
        let sub_cell: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let seen = Arc::clone(&count);
        let cell = Arc::clone(&sub_cell);
        let sub = cache.connect().subscribe_fn(move |_| {
            *seen.lock() += 1;
            if let Some(sub) = cell.lock().take() {
                sub.dispose();
            }
        });
        *sub_cell.lock() = Some(sub);

        cache.add_or_update(person("a", 1));
        cache.add_or_update(person("b", 2));

        assert_eq!(*count.lock(), 1);
    }
}
