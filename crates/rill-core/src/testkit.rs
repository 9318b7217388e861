//! Shared test support: a batch collector that folds everything it sees.

use std::hash::Hash;
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::change::ChangeSet;
use crate::connect::{Observer, StreamFault};

/// Records every batch and terminal signal, folding batches into a map so
/// tests can assert on both the message sequence and the resulting state.
pub(crate) struct Collector<K, V> {
    inner: Arc<Mutex<CollectorState<K, V>>>,
}

struct CollectorState<K, V> {
    batches: Vec<ChangeSet<K, V>>,
    data: FxHashMap<K, V>,
    completed: bool,
    faults: Vec<StreamFault>,
}

impl<K, V> Collector<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(CollectorState {
                batches: Vec::new(),
                data: FxHashMap::default(),
                completed: false,
                faults: Vec::new(),
            })),
        }
    }

    /// A fresh observer feeding this collector.
    pub(crate) fn observer(&self) -> CollectorObserver<K, V> {
        CollectorObserver {
            inner: Arc::clone(&self.inner),
        }
    }

    pub(crate) fn batches(&self) -> Vec<ChangeSet<K, V>> {
        self.inner.lock().batches.clone()
    }

    /// The fold of every received batch.
    pub(crate) fn data(&self) -> FxHashMap<K, V> {
        self.inner.lock().data.clone()
    }

    pub(crate) fn completed(&self) -> bool {
        self.inner.lock().completed
    }

    pub(crate) fn faults(&self) -> Vec<StreamFault> {
        self.inner.lock().faults.clone()
    }
}

pub(crate) struct CollectorObserver<K, V> {
    inner: Arc<Mutex<CollectorState<K, V>>>,
}

impl<K, V> Observer<K, V> for CollectorObserver<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    fn on_changes(&mut self, changes: &ChangeSet<K, V>) {
        let mut state = self.inner.lock();
        changes.apply_to(&mut state.data);
        state.batches.push(changes.clone());
    }

    fn on_fault(&mut self, fault: &StreamFault) {
        self.inner.lock().faults.push(fault.clone());
    }

    fn on_completed(&mut self) {
        self.inner.lock().completed = true;
    }
}
