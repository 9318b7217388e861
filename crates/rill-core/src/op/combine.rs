//! Set algebra over several change streams.
//!
//! [`Connection::combine`] merges N connections under a [`CombineRule`]
//! deciding per-key inclusion from which sources currently hold the key.
//! The output value for an included key always comes from the lowest-index
//! source holding it; each upstream batch yields at most one downstream
//! batch describing the membership transitions it caused.

use std::hash::Hash;
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::change::{Change, ChangeSet};
use crate::connect::{Connection, Observer, Slot, StreamFault, Subscription};
use crate::Error;

/// Membership rule for [`Connection::combine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombineRule {
    /// Included when every source holds the key.
    And,
    /// Included when any source holds the key.
    Or,
    /// Included when exactly one source holds the key.
    Xor,
    /// Included when source 0 holds the key and no other source does.
    Except,
}

impl CombineRule {
    fn includes(self, holders: usize, total: usize, first_holds: bool) -> bool {
        match self {
            Self::And => holders == total,
            Self::Or => holders >= 1,
            Self::Xor => holders == 1,
            Self::Except => first_holds && holders == 1,
        }
    }
}

impl<K, V> Connection<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + PartialEq + Send + 'static,
{
    /// Combines this connection with `others` under `rule`.
    ///
    /// Transitions per upstream batch: a key turning included emits Add; a
    /// key turning excluded emits Remove carrying the last output value; an
    /// included key whose chosen value changed emits Update. A Refresh is
    /// forwarded when it comes from the chosen source of an included key.
    /// The result completes once every source has completed; a fault from
    /// any source is forwarded terminally.
    ///
    /// Downstream callbacks must not mutate any of the combined sources;
    /// delivery runs under the combiner's state lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotEnoughSources`] when `others` is empty.
    pub fn combine(
        self,
        rule: CombineRule,
        others: Vec<Connection<K, V>>,
    ) -> crate::Result<Connection<K, V>> {
        let total = 1 + others.len();
        if total < 2 {
            return Err(Error::NotEnoughSources { count: total });
        }
        Ok(Connection::from_subscribe(move |down: Slot<K, V>| {
            let state = Arc::new(Mutex::new(CombineState {
                slots: FxHashMap::default(),
                output: FxHashMap::default(),
                completed: 0,
                total,
                done: false,
            }));
            let subs: Arc<Mutex<Option<Vec<Subscription>>>> =
                Arc::new(Mutex::new(Some(Vec::with_capacity(total))));

            let mut sources = Vec::with_capacity(total);
            sources.push(self);
            sources.extend(others);
            for (index, source) in sources.into_iter().enumerate() {
                let sub = source.subscribe(CombineObserver {
                    index,
                    rule,
                    state: Arc::clone(&state),
                    down: down.clone(),
                });
                let mut cell = subs.lock();
                match cell.as_mut() {
                    Some(open) => open.push(sub),
                    None => sub.dispose(),
                }
            }

            let closer = down;
            Subscription::new(move || {
                if let Some(open) = subs.lock().take() {
                    for sub in open {
                        sub.dispose();
                    }
                }
                closer.close();
            })
        }))
    }

    /// Keys present in every source. See [`Connection::combine`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotEnoughSources`] when `others` is empty.
    pub fn and(self, others: Vec<Connection<K, V>>) -> crate::Result<Connection<K, V>> {
        self.combine(CombineRule::And, others)
    }

    /// Keys present in any source. See [`Connection::combine`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotEnoughSources`] when `others` is empty.
    pub fn or(self, others: Vec<Connection<K, V>>) -> crate::Result<Connection<K, V>> {
        self.combine(CombineRule::Or, others)
    }

    /// Keys present in exactly one source. See [`Connection::combine`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotEnoughSources`] when `others` is empty.
    pub fn xor(self, others: Vec<Connection<K, V>>) -> crate::Result<Connection<K, V>> {
        self.combine(CombineRule::Xor, others)
    }

    /// Keys present here and in no other source. See [`Connection::combine`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotEnoughSources`] when `others` is empty.
    pub fn except(self, others: Vec<Connection<K, V>>) -> crate::Result<Connection<K, V>> {
        self.combine(CombineRule::Except, others)
    }
}

struct CombineState<K, V> {
    /// Latest value per source, per key. Index = source index.
    slots: FxHashMap<K, SmallVec<[Option<V>; 2]>>,
    /// Current downstream membership and its emitted value.
    output: FxHashMap<K, V>,
    completed: usize,
    total: usize,
    done: bool,
}

struct CombineObserver<K, V> {
    index: usize,
    rule: CombineRule,
    state: Arc<Mutex<CombineState<K, V>>>,
    down: Slot<K, V>,
}

impl<K, V> Observer<K, V> for CombineObserver<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + PartialEq + Send + 'static,
{
    fn on_changes(&mut self, changes: &ChangeSet<K, V>) {
        let mut state = self.state.lock();
        if state.done {
            return;
        }
        let total = state.total;
        let mut out = ChangeSet::new();

        for change in changes {
            let key = change.key();
            let entry = state
                .slots
                .entry(key.clone())
                .or_insert_with(|| SmallVec::from_elem(None, total));
            let refreshed = matches!(change, Change::Refresh { .. });
            match change {
                Change::Remove { .. } => entry[self.index] = None,
                _ => entry[self.index] = Some(change.current().clone()),
            }

            let holders = entry.iter().flatten().count();
            let chosen_index = entry.iter().position(Option::is_some);
            let chosen: Option<V> = chosen_index
                .and_then(|i| entry[i].clone());
            if entry.iter().all(Option::is_none) {
                state.slots.remove(key);
            }
            let first_holds = chosen_index == Some(0);
            let included = self
                .rule
                .includes(holders, total, first_holds)
                && chosen.is_some();

            let before = state.output.get(key).cloned();
            match (before, included) {
                (None, true) => {
                    let value = chosen.unwrap_or_else(|| unreachable!());
                    state.output.insert(key.clone(), value.clone());
                    out.push(Change::Add {
                        key: key.clone(),
                        current: value,
                    });
                }
                (Some(old), false) => {
                    state.output.remove(key);
                    out.push(Change::Remove {
                        key: key.clone(),
                        current: old,
                    });
                }
                (Some(old), true) => {
                    let value = chosen.unwrap_or_else(|| unreachable!());
                    if refreshed && chosen_index == Some(self.index) && value == old {
                        out.push(Change::Refresh {
                            key: key.clone(),
                            current: value,
                        });
                    } else if value != old {
                        state.output.insert(key.clone(), value.clone());
                        out.push(Change::Update {
                            key: key.clone(),
                            current: value,
                            previous: old,
                        });
                    }
                }
                (None, false) => {}
            }
        }

        if !out.is_empty() {
            self.down.deliver(&out);
        }
    }

    fn on_fault(&mut self, fault: &StreamFault) {
        {
            let mut state = self.state.lock();
            if state.done {
                return;
            }
            state.done = true;
        }
        self.down.fault(fault);
    }

    fn on_completed(&mut self) {
        {
            let mut state = self.state.lock();
            if state.done {
                return;
            }
            state.completed += 1;
            if state.completed < state.total {
                return;
            }
            state.done = true;
        }
        self.down.complete();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
