//! Per-item value projection.

use std::hash::Hash;

use crate::change::{Change, ChangeSet};
use crate::connect::{Connection, Observer, Slot, StreamFault, Subscription};

impl<K, V> Connection<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Maps every value through `f`, preserving keys and change kinds.
    ///
    /// `Update` maps both its current and previous value; the initial
    /// snapshot is mapped the same way. Stateless.
    #[must_use]
    pub fn transform<U, F>(self, f: F) -> Connection<K, U>
    where
        U: Clone + Send + 'static,
        F: Fn(&V) -> U + Send + 'static,
    {
        Connection::from_subscribe(move |down: Slot<K, U>| {
            let closer = down.clone();
            let up = self.subscribe(TransformObserver { map: f, down });
            Subscription::new(move || {
                up.dispose();
                closer.close();
            })
        })
    }
}

struct TransformObserver<F, K, U> {
    map: F,
    down: Slot<K, U>,
}

impl<K, V, U, F> Observer<K, V> for TransformObserver<F, K, U>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
    U: Clone + Send + 'static,
    F: Fn(&V) -> U + Send,
{
    fn on_changes(&mut self, changes: &ChangeSet<K, V>) {
        let mut mapped = ChangeSet::new();
        for change in changes {
            mapped.push(match change {
                Change::Add { key, current } => Change::Add {
                    key: key.clone(),
                    current: (self.map)(current),
                },
                Change::Update {
                    key,
                    current,
                    previous,
                } => Change::Update {
                    key: key.clone(),
                    current: (self.map)(current),
                    previous: (self.map)(previous),
                },
                Change::Remove { key, current } => Change::Remove {
                    key: key.clone(),
                    current: (self.map)(current),
                },
                Change::Refresh { key, current } => Change::Refresh {
                    key: key.clone(),
                    current: (self.map)(current),
                },
            });
        }
        self.down.deliver(&mapped);
    }

    fn on_fault(&mut self, fault: &StreamFault) {
        self.down.fault(fault);
    }

    fn on_completed(&mut self) {
        self.down.complete();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
