//! Change model — the unit of mutation flowing through every connection.
//!
//! A [`Change`] describes one mutation to one key. A [`ChangeSet`] is the
//! ordered batch of changes produced by one logical edit; batches are the
//! only thing producers emit and consumers observe.
//!
//! ## Net-effect coalescing
//!
//! [`ChangeSet::coalesce`] folds any number of batches into the single batch
//! a consumer would need to catch up in one step. The same rule backs edit
//! transactions (several mutations, one batch) and the pause gate (buffered
//! batches merged on resume). Per key:
//!
//! - Add + Update → Add carrying the latest value
//! - Add + Remove → nothing (the key never happened)
//! - Update + Update → Update keeping the earliest previous value
//! - Update + Remove → Remove
//! - Remove + Add → Update (previous = the removed value)
//! - Refresh + Refresh → Refresh

use fxhash::FxHashMap;
use smallvec::SmallVec;
use std::hash::Hash;

// ---------------------------------------------------------------------------
// Change
// ---------------------------------------------------------------------------

/// One mutation to one key.
///
/// `Update` always carries the immediately preceding value for its key.
/// `Refresh` signals an in-place mutation with no identity change and
/// records no previous value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change<K, V> {
    /// The key entered the collection.
    Add {
        /// The key that was added.
        key: K,
        /// The value stored under the key.
        current: V,
    },
    /// The key's value was replaced.
    Update {
        /// The key that was updated.
        key: K,
        /// The new value.
        current: V,
        /// The value the key held immediately before this change.
        previous: V,
    },
    /// The key left the collection.
    Remove {
        /// The key that was removed.
        key: K,
        /// The value the key held at removal.
        current: V,
    },
    /// The key's value mutated in place.
    Refresh {
        /// The key that was refreshed.
        key: K,
        /// The value as of the refresh.
        current: V,
    },
}

impl<K, V> Change<K, V> {
    /// Returns the key this change touches.
    #[inline]
    #[must_use]
    pub fn key(&self) -> &K {
        match self {
            Self::Add { key, .. }
            | Self::Update { key, .. }
            | Self::Remove { key, .. }
            | Self::Refresh { key, .. } => key,
        }
    }

    /// Returns the value carried by this change.
    ///
    /// For `Remove` this is the value the key held at removal.
    #[inline]
    #[must_use]
    pub fn current(&self) -> &V {
        match self {
            Self::Add { current, .. }
            | Self::Update { current, .. }
            | Self::Remove { current, .. }
            | Self::Refresh { current, .. } => current,
        }
    }

    /// Returns the preceding value, present only for `Update`.
    #[inline]
    #[must_use]
    pub fn previous(&self) -> Option<&V> {
        match self {
            Self::Update { previous, .. } => Some(previous),
            _ => None,
        }
    }

    /// Merges a later change into an earlier one for the same key.
    ///
    /// Returns `None` when the pair nets to nothing (Add then Remove).
    fn merge(prior: Self, next: Self) -> Option<Self> {
        match (prior, next) {
            (Self::Add { .. }, Self::Remove { .. }) => None,
            (Self::Add { key, .. }, Self::Add { current, .. })
            | (Self::Add { key, .. }, Self::Update { current, .. })
            | (Self::Add { key, .. }, Self::Refresh { current, .. })
            | (Self::Refresh { key, .. }, Self::Add { current, .. }) => {
                Some(Self::Add { key, current })
            }
            (Self::Update { key, previous, .. }, Self::Update { current, .. })
            | (Self::Update { key, previous, .. }, Self::Refresh { current, .. })
            | (Self::Update { key, previous, .. }, Self::Add { current, .. }) => {
                Some(Self::Update {
                    key,
                    current,
                    previous,
                })
            }
            (Self::Update { key, .. }, Self::Remove { current, .. })
            | (Self::Refresh { key, .. }, Self::Remove { current, .. }) => {
                Some(Self::Remove { key, current })
            }
            (
                Self::Remove {
                    key,
                    current: removed,
                },
                Self::Add { current, .. },
            )
            | (
                Self::Remove {
                    key,
                    current: removed,
                },
                Self::Update { current, .. },
            ) => Some(Self::Update {
                key,
                current,
                previous: removed,
            }),
            (Self::Remove { key, current }, Self::Remove { .. })
            | (Self::Remove { key, current }, Self::Refresh { .. }) => {
                Some(Self::Remove { key, current })
            }
            (Self::Refresh { key, .. }, Self::Refresh { current, .. }) => {
                Some(Self::Refresh { key, current })
            }
            (Self::Refresh { key, .. }, Self::Update { current, previous, .. }) => {
                Some(Self::Update {
                    key,
                    current,
                    previous,
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ChangeSet
// ---------------------------------------------------------------------------

/// One atomic, ordered batch of changes.
///
/// Order within a batch is the insertion order of the underlying edit
/// operations. Summary counts are derived on demand, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet<K, V> {
    changes: SmallVec<[Change<K, V>; 4]>,
}

impl<K, V> ChangeSet<K, V> {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self {
            changes: SmallVec::new(),
        }
    }

    /// Appends a change to the batch.
    pub fn push(&mut self, change: Change<K, V>) {
        self.changes.push(change);
    }

    /// Number of changes in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Whether the batch contains no changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Iterates over the changes in batch order.
    pub fn iter(&self) -> std::slice::Iter<'_, Change<K, V>> {
        self.changes.iter()
    }

    /// Number of `Add` changes in the batch.
    #[must_use]
    pub fn adds(&self) -> usize {
        self.iter()
            .filter(|c| matches!(c, Change::Add { .. }))
            .count()
    }

    /// Number of `Update` changes in the batch.
    #[must_use]
    pub fn updates(&self) -> usize {
        self.iter()
            .filter(|c| matches!(c, Change::Update { .. }))
            .count()
    }

    /// Number of `Remove` changes in the batch.
    #[must_use]
    pub fn removes(&self) -> usize {
        self.iter()
            .filter(|c| matches!(c, Change::Remove { .. }))
            .count()
    }

    /// Number of `Refresh` changes in the batch.
    #[must_use]
    pub fn refreshes(&self) -> usize {
        self.iter()
            .filter(|c| matches!(c, Change::Refresh { .. }))
            .count()
    }
}

impl<K, V> Default for ChangeSet<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> IntoIterator for ChangeSet<K, V> {
    type Item = Change<K, V>;
    type IntoIter = smallvec::IntoIter<[Change<K, V>; 4]>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

impl<'a, K, V> IntoIterator for &'a ChangeSet<K, V> {
    type Item = &'a Change<K, V>;
    type IntoIter = std::slice::Iter<'a, Change<K, V>>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

impl<K, V> ChangeSet<K, V>
where
    K: Clone + Eq + Hash,
{
    /// Folds any number of batches into their single net-effect batch.
    ///
    /// Changes touching the same key collapse to the net mutation a consumer
    /// would need to apply; keys whose changes cancel out disappear entirely.
    /// Output order is the order in which each key was first touched.
    #[must_use]
    pub fn coalesce<I>(batches: I) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        let mut order: Vec<K> = Vec::new();
        let mut net: FxHashMap<K, Change<K, V>> = FxHashMap::default();

        for batch in batches {
            for change in batch {
                let key = change.key().clone();
                match net.remove(&key) {
                    None => {
                        order.push(key.clone());
                        net.insert(key, change);
                    }
                    Some(prior) => {
                        if let Some(merged) = Change::merge(prior, change) {
                            net.insert(key, merged);
                        }
                    }
                }
            }
        }

        let mut out = Self::new();
        for key in order {
            if let Some(change) = net.remove(&key) {
                out.push(change);
            }
        }
        out
    }
}

impl<K, V> ChangeSet<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    /// Retains only the changes whose key/current value satisfy `predicate`.
    pub(crate) fn filtered<F>(&self, predicate: F) -> Self
    where
        F: Fn(&K, &V) -> bool,
    {
        let mut out = Self::new();
        for change in self.iter() {
            if predicate(change.key(), change.current()) {
                out.push(change.clone());
            }
        }
        out
    }

    /// Applies the batch to a key→value map, in batch order.
    pub(crate) fn apply_to(&self, map: &mut FxHashMap<K, V>) {
        for change in self.iter() {
            match change {
                Change::Add { key, current }
                | Change::Update { key, current, .. }
                | Change::Refresh { key, current } => {
                    map.insert(key.clone(), current.clone());
                }
                Change::Remove { key, .. } => {
                    map.remove(key);
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn add(key: &str, v: i32) -> Change<String, i32> {
        Change::Add {
            key: key.to_string(),
            current: v,
        }
    }

    fn update(key: &str, v: i32, prev: i32) -> Change<String, i32> {
        Change::Update {
            key: key.to_string(),
            current: v,
            previous: prev,
        }
    }

    fn remove(key: &str, v: i32) -> Change<String, i32> {
        Change::Remove {
            key: key.to_string(),
            current: v,
        }
    }

    fn refresh(key: &str, v: i32) -> Change<String, i32> {
        Change::Refresh {
            key: key.to_string(),
            current: v,
        }
    }

    fn batch(changes: Vec<Change<String, i32>>) -> ChangeSet<String, i32> {
        let mut set = ChangeSet::new();
        for c in changes {
            set.push(c);
        }
        set
    }

    // --- Summary counts ---

    #[test]
    fn counts_are_derived() {
        let set = batch(vec![
            add("a", 1),
            update("b", 2, 1),
            remove("c", 3),
            refresh("d", 4),
            add("e", 5),
        ]);
        assert_eq!(set.len(), 5);
        assert_eq!(set.adds(), 2);
        assert_eq!(set.updates(), 1);
        assert_eq!(set.removes(), 1);
        assert_eq!(set.refreshes(), 1);
    }

    #[test]
    fn accessors() {
        let c = update("a", 2, 1);
        assert_eq!(c.key(), "a");
        assert_eq!(*c.current(), 2);
        assert_eq!(c.previous(), Some(&1));
        assert_eq!(add("a", 1).previous(), None);
    }

    // --- Coalescing ---

    #[test]
    fn add_then_remove_cancels() {
        let net = ChangeSet::coalesce([batch(vec![add("a", 1), remove("a", 1)])]);
        assert!(net.is_empty());
    }

    #[test]
    fn add_then_update_stays_add() {
        let net = ChangeSet::coalesce([batch(vec![add("a", 1), update("a", 2, 1)])]);
        assert_eq!(net.len(), 1);
        assert_eq!(net.iter().next(), Some(&add("a", 2)));
    }

    #[test]
    fn update_chain_keeps_earliest_previous() {
        let net = ChangeSet::coalesce([batch(vec![update("a", 2, 1), update("a", 3, 2)])]);
        assert_eq!(net.iter().next(), Some(&update("a", 3, 1)));
    }

    #[test]
    fn update_then_remove_is_remove() {
        let net = ChangeSet::coalesce([batch(vec![update("a", 2, 1), remove("a", 2)])]);
        assert_eq!(net.iter().next(), Some(&remove("a", 2)));
    }

    #[test]
    fn remove_then_add_is_update() {
        let net = ChangeSet::coalesce([batch(vec![remove("a", 1), add("a", 9)])]);
        assert_eq!(net.iter().next(), Some(&update("a", 9, 1)));
    }

    #[test]
    fn refreshes_collapse() {
        let net = ChangeSet::coalesce([batch(vec![refresh("a", 1), refresh("a", 1)])]);
        assert_eq!(net.len(), 1);
        assert_eq!(net.refreshes(), 1);
    }

    #[test]
    fn add_then_refresh_stays_add() {
        let net = ChangeSet::coalesce([batch(vec![add("a", 1), refresh("a", 1)])]);
        assert_eq!(net.iter().next(), Some(&add("a", 1)));
    }

    #[test]
    fn coalesce_spans_batches() {
        let net = ChangeSet::coalesce([
            batch(vec![add("a", 1), add("b", 1)]),
            batch(vec![update("a", 2, 1), remove("b", 1)]),
        ]);
        assert_eq!(net.len(), 1);
        assert_eq!(net.iter().next(), Some(&add("a", 2)));
    }

    #[test]
    fn first_touch_order_preserved() {
        let net = ChangeSet::coalesce([batch(vec![
            add("b", 1),
            add("a", 1),
            update("b", 2, 1),
        ])]);
        let keys: Vec<&str> = net.iter().map(|c| c.key().as_str()).collect();
        assert_eq!(keys, vec!["b", "a"]);
    }

    // --- Filtering and folding ---

    #[test]
    fn filtered_drops_non_matching() {
        let set = batch(vec![add("a", 1), add("b", 10), remove("c", 20)]);
        let even = set.filtered(|_, v| *v >= 10);
        assert_eq!(even.len(), 2);
        assert!(even.iter().all(|c| *c.current() >= 10));
    }

    #[test]
    fn apply_to_folds_batches() {
        let mut map = FxHashMap::default();
        batch(vec![add("a", 1), add("b", 2)]).apply_to(&mut map);
        batch(vec![update("a", 5, 1), remove("b", 2)]).apply_to(&mut map);
        assert_eq!(map.get("a"), Some(&5));
        assert_eq!(map.get("b"), None);
    }
}
