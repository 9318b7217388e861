//! Per-item resource lifecycle.
//!
//! [`Connection::subscribe_each`] acquires one [`Subscription`] per present
//! key through a caller-supplied factory and keeps it exactly as long as
//! the key's value lives. The ordering guarantee is release-before-forward:
//! when a downstream observer sees an Update or Remove, the handle for the
//! outgoing value is already released.

use std::hash::Hash;
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::change::{Change, ChangeSet};
use crate::connect::{Connection, Observer, Slot, StreamFault, Subscription};

impl<K, V> Connection<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Attaches a factory-made resource to each item for its lifetime.
    ///
    /// Add acquires; Update releases the previous value's handle, then the
    /// Update is forwarded; Remove releases, then forwards; Refresh leaves
    /// the handle untouched. Completion or disposal releases every retained
    /// handle. A factory error releases everything, unsubscribes upstream
    /// and faults the downstream terminally; the upstream source itself is
    /// unaffected.
    #[must_use]
    pub fn subscribe_each<F>(self, factory: F) -> Connection<K, V>
    where
        F: Fn(&K, &V) -> Result<Subscription, StreamFault> + Send + 'static,
    {
        Connection::from_subscribe(move |down: Slot<K, V>| {
            let upstream: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
            let closer = down.clone();
            let sub = self.subscribe(LifecycleObserver {
                factory,
                handles: FxHashMap::default(),
                down,
                upstream: Arc::clone(&upstream),
            });
            // The initial snapshot is delivered inside subscribe; a factory
            // error there has already closed the downstream slot.
            if closer.is_open() {
                *upstream.lock() = Some(sub);
            } else {
                sub.dispose();
            }
            let cell = upstream;
            Subscription::new(move || {
                if let Some(sub) = cell.lock().take() {
                    sub.dispose();
                }
                closer.close();
            })
        })
    }
}

struct LifecycleObserver<K, V, F> {
    factory: F,
    handles: FxHashMap<K, Subscription>,
    down: Slot<K, V>,
    upstream: Arc<Mutex<Option<Subscription>>>,
}

impl<K, V, F> LifecycleObserver<K, V, F>
where
    K: Clone + Eq + Hash,
{
    fn release(&mut self, key: &K) {
        if let Some(handle) = self.handles.remove(key) {
            handle.dispose();
        }
    }

    fn release_all(&mut self) {
        for (_, handle) in self.handles.drain() {
            handle.dispose();
        }
    }

    fn fail(&mut self, fault: &StreamFault) {
        tracing::warn!(error = %fault, "item subscription factory failed");
        self.release_all();
        self.down.fault(fault);
        if let Some(sub) = self.upstream.lock().take() {
            sub.dispose();
        }
    }
}

impl<K, V, F> Observer<K, V> for LifecycleObserver<K, V, F>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
    F: Fn(&K, &V) -> Result<Subscription, StreamFault> + Send,
{
    fn on_changes(&mut self, changes: &ChangeSet<K, V>) {
        for change in changes {
            match change {
                Change::Add { key, current } | Change::Update { key, current, .. } => {
                    self.release(key);
                    match (self.factory)(key, current) {
                        Ok(handle) => {
                            self.handles.insert(key.clone(), handle);
                        }
                        Err(fault) => {
                            self.fail(&fault);
                            return;
                        }
                    }
                }
                Change::Remove { key, .. } => self.release(key),
                Change::Refresh { .. } => {}
            }
        }
        self.down.deliver(changes);
    }

    fn on_fault(&mut self, fault: &StreamFault) {
        self.release_all();
        self.down.fault(fault);
    }

    fn on_completed(&mut self) {
        self.release_all();
        self.down.complete();
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SourceCache;
    use crate::testkit::Collector;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// A value carrying a flag that flips when its handle is released.
    #[derive(Debug, Clone)]
    struct Resource {
        id: u32,
        generation: u32,
        released: Arc<AtomicBool>,
    }

    impl PartialEq for Resource {
        fn eq(&self, other: &Self) -> bool {
            self.id == other.id && self.generation == other.generation
        }
    }

    fn resource(id: u32, generation: u32) -> Resource {
        Resource {
            id,
            generation,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    fn make_cache() -> SourceCache<u32, Resource> {
        SourceCache::new(|r: &Resource| r.id)
    }

    fn tracking_factory(_: &u32, value: &Resource) -> Result<Subscription, StreamFault> {
        let flag = Arc::clone(&value.released);
        Ok(Subscription::new(move || {
            flag.store(true, Ordering::SeqCst);
        }))
    }

    #[test]
    fn add_acquires_remove_releases() {
        let cache = make_cache();
        let _sub = cache
            .connect()
            .subscribe_each(tracking_factory)
            .subscribe_fn(|_| {});

        let r = resource(1, 0);
        let released = Arc::clone(&r.released);
        cache.add_or_update(r);
        assert!(!released.load(Ordering::SeqCst));

        cache.remove(&1);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn update_releases_previous_before_forwarding() {
        let cache = make_cache();
        let first = resource(1, 0);
        let first_released = Arc::clone(&first.released);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let probe = Arc::clone(&first_released);
        let _sub = cache
            .connect()
            .subscribe_each(tracking_factory)
            .subscribe_fn(move |changes| {
                for change in changes {
                    if change.previous().is_some() {
                        // At delivery time the outgoing handle is gone.
                        sink.lock().push(probe.load(Ordering::SeqCst));
                    }
                }
            });

        cache.add_or_update(first);
        cache.add_or_update(resource(1, 1));

        assert_eq!(*seen.lock(), vec![true]);
    }

    #[test]
    fn refresh_leaves_handle_untouched() {
        let cache = make_cache();
        let _sub = cache
            .connect()
            .subscribe_each(tracking_factory)
            .subscribe_fn(|_| {});

        let r = resource(1, 0);
        let released = Arc::clone(&r.released);
        cache.add_or_update(r);
        cache.refresh(&1);

        assert!(!released.load(Ordering::SeqCst));
    }

    #[test]
    fn completion_releases_everything() {
        let cache = make_cache();
        let collector = Collector::new();
        let _sub = cache
            .connect()
            .subscribe_each(tracking_factory)
            .subscribe(collector.observer());

        let a = resource(1, 0);
        let b = resource(2, 0);
        let flags = [Arc::clone(&a.released), Arc::clone(&b.released)];
        cache.add_or_update_many([a, b]);

        cache.dispose();
        assert!(collector.completed());
        assert!(flags.iter().all(|f| f.load(Ordering::SeqCst)));
    }

    #[test]
    fn disposal_releases_everything() {
        let cache = make_cache();
        let sub = cache
            .connect()
            .subscribe_each(tracking_factory)
            .subscribe_fn(|_| {});

        let r = resource(1, 0);
        let released = Arc::clone(&r.released);
        cache.add_or_update(r);

        sub.dispose();
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn factory_error_faults_downstream_and_releases() {
        let cache = make_cache();
        let collector = Collector::new();
        let _sub = cache
            .connect()
            .subscribe_each(|_: &u32, value: &Resource| {
                if value.generation > 0 {
                    return Err(StreamFault::new("no handle for generation > 0"));
                }
                tracking_factory(&value.id, value)
            })
            .subscribe(collector.observer());

        let ok = resource(1, 0);
        let ok_released = Arc::clone(&ok.released);
        cache.add_or_update(ok);
        cache.add_or_update(resource(2, 1));

        let faults = collector.faults();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].message(), "no handle for generation > 0");
        assert!(ok_released.load(Ordering::SeqCst));

        // The cache itself is unaffected and keeps serving other observers.
        assert_eq!(cache.len(), 2);
        let late = Collector::new();
        let _late_sub = cache.connect().subscribe(late.observer());
        assert_eq!(late.batches().len(), 1);
    }

    #[test]
    fn factory_error_on_snapshot_faults_immediately() {
        let cache = make_cache();
        cache.add_or_update(resource(1, 5));

        let collector = Collector::new();
        let _sub = cache
            .connect()
            .subscribe_each(|_: &u32, _: &Resource| Err(StreamFault::new("refused")))
            .subscribe(collector.observer());

        assert_eq!(collector.faults().len(), 1);
        assert!(collector.batches().is_empty());
    }
}
