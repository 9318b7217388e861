//! Query-on-change projection.
//!
//! [`Connection::query_when_changed`] folds a change stream into a keyed
//! snapshot and pushes the whole snapshot after every batch, for consumers
//! that evaluate the collection as a unit instead of applying deltas.

use std::hash::Hash;

use fxhash::FxHashMap;

use crate::change::ChangeSet;
use crate::connect::{Connection, Observer, StreamFault, Subscription};
use crate::feed::{FeedConnection, ValueSlot};

/// Snapshot of a keyed collection, pushed by
/// [`Connection::query_when_changed`] after each batch.
#[derive(Debug, Clone)]
pub struct Query<K, V> {
    entries: FxHashMap<K, V>,
}

impl<K, V> Query<K, V>
where
    K: Eq + Hash,
{
    /// Number of keys in the snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up a value by key.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Whether the key is present.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Iterates the entries in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter()
    }
}

impl<K, V> Connection<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Projects the stream into whole-collection snapshots.
    ///
    /// One [`Query`] is pushed after every upstream batch, including the
    /// initial snapshot batch of a cache that already holds items. The
    /// query stream completes when the upstream completes; an upstream
    /// fault also completes it, the fault itself ends at this boundary.
    #[must_use]
    pub fn query_when_changed(self) -> FeedConnection<Query<K, V>> {
        FeedConnection::from_subscribe(move |down: ValueSlot<Query<K, V>>| {
            let closer = down.clone();
            let sub = self.subscribe(QueryObserver {
                entries: FxHashMap::default(),
                down,
            });
            Subscription::new(move || {
                sub.dispose();
                closer.close();
            })
        })
    }
}

struct QueryObserver<K, V> {
    entries: FxHashMap<K, V>,
    down: ValueSlot<Query<K, V>>,
}

impl<K, V> Observer<K, V> for QueryObserver<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    fn on_changes(&mut self, changes: &ChangeSet<K, V>) {
        changes.apply_to(&mut self.entries);
        self.down.deliver(&Query {
            entries: self.entries.clone(),
        });
    }

    fn on_fault(&mut self, _fault: &StreamFault) {
        self.down.complete();
    }

    fn on_completed(&mut self) {
        self.down.complete();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
