//! Edit transactions.
//!
//! An [`Editor`] stages mutations against a snapshot of the cache without
//! touching it. Reads through the editor observe the staged state. On
//! commit the staged log coalesces to one net [`ChangeSet`]; if the caller's
//! closure returns an error the editor is simply dropped and the cache is
//! untouched.

use std::hash::Hash;

use fxhash::FxHashMap;

use crate::change::{Change, ChangeSet};

/// Staged mutation surface handed to [`SourceCache::edit`] closures.
///
/// [`SourceCache::edit`]: crate::cache::SourceCache::edit
pub struct Editor<'a, K, V> {
    base: &'a FxHashMap<K, V>,
    key_of: &'a (dyn Fn(&V) -> K + Send + Sync),
    /// `Some(v)` stages an upsert, `None` stages a removal.
    staged: FxHashMap<K, Option<V>>,
    log: ChangeSet<K, V>,
}

impl<'a, K, V> Editor<'a, K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    pub(crate) fn new(
        base: &'a FxHashMap<K, V>,
        key_of: &'a (dyn Fn(&V) -> K + Send + Sync),
    ) -> Self {
        Self {
            base,
            key_of,
            staged: FxHashMap::default(),
            log: ChangeSet::new(),
        }
    }

    /// Stages an insert or replacement; the key comes from the key selector.
    pub fn add_or_update(&mut self, value: V) {
        let key = (self.key_of)(&value);
        match self.get(&key).cloned() {
            Some(previous) => self.log.push(Change::Update {
                key: key.clone(),
                current: value.clone(),
                previous,
            }),
            None => self.log.push(Change::Add {
                key: key.clone(),
                current: value.clone(),
            }),
        }
        self.staged.insert(key, Some(value));
    }

    /// Stages a removal. Absent keys are a silent no-op.
    pub fn remove(&mut self, key: &K) -> bool {
        let Some(current) = self.get(key).cloned() else {
            return false;
        };
        self.log.push(Change::Remove {
            key: key.clone(),
            current,
        });
        self.staged.insert(key.clone(), None);
        true
    }

    /// Stages a refresh signal for a present key.
    pub fn refresh(&mut self, key: &K) -> bool {
        let Some(current) = self.get(key).cloned() else {
            return false;
        };
        self.log.push(Change::Refresh {
            key: key.clone(),
            current,
        });
        true
    }

    /// Stages the removal of every present key.
    pub fn clear(&mut self) {
        for key in self.keys() {
            self.remove(&key);
        }
    }

    /// Reads a value through the staged overlay.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        match self.staged.get(key) {
            Some(Some(value)) => Some(value),
            Some(None) => None,
            None => self.base.get(key),
        }
    }

    /// Whether the key is present in the staged state.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Number of keys in the staged state.
    #[must_use]
    pub fn len(&self) -> usize {
        let mut len = self.base.len();
        for (key, entry) in &self.staged {
            match (entry.is_some(), self.base.contains_key(key)) {
                (true, false) => len += 1,
                (false, true) => len -= 1,
                _ => {}
            }
        }
        len
    }

    /// Whether the staged state holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn keys(&self) -> Vec<K> {
        let mut keys: Vec<K> = self
            .base
            .keys()
            .filter(|key| !matches!(self.staged.get(*key), Some(None)))
            .cloned()
            .collect();
        for (key, entry) in &self.staged {
            if entry.is_some() && !self.base.contains_key(key) {
                keys.push(key.clone());
            }
        }
        keys
    }

    /// Consumes the editor, returning the net-effect batch of its log.
    pub(crate) fn into_net(self) -> ChangeSet<K, V> {
        ChangeSet::coalesce([self.log])
    }
}

// ===========================================================================
// Tests
// ===========================================================================
