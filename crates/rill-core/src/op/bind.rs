//! Ordered collection projection.

use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::change::{Change, ChangeSet};
use crate::connect::{Connection, Observer, Slot, StreamFault, Subscription};

impl<K, V> Connection<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + PartialEq + Send + 'static,
{
    /// Projects the stream onto a shared `Vec`, passing batches through.
    ///
    /// Adds append in batch order; an Update replaces the element equal to
    /// its previous value; a Remove deletes the element equal to the
    /// removed value; a Refresh rewrites the equal element in place. After
    /// each batch the target's contents equal the source's contents.
    #[must_use]
    pub fn bind(self, target: Arc<Mutex<Vec<V>>>) -> Connection<K, V> {
        Connection::from_subscribe(move |down: Slot<K, V>| {
            let closer = down.clone();
            let up = self.subscribe(BindObserver { target, down });
            Subscription::new(move || {
                up.dispose();
                closer.close();
            })
        })
    }
}

struct BindObserver<K, V> {
    target: Arc<Mutex<Vec<V>>>,
    down: Slot<K, V>,
}

impl<K, V> Observer<K, V> for BindObserver<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + PartialEq + Send + 'static,
{
    fn on_changes(&mut self, changes: &ChangeSet<K, V>) {
        {
            let mut target = self.target.lock();
            for change in changes {
                apply(&mut target, change);
            }
        }
        self.down.deliver(changes);
    }

    fn on_fault(&mut self, fault: &StreamFault) {
        self.down.fault(fault);
    }

    fn on_completed(&mut self) {
        self.down.complete();
    }
}

fn apply<K, V>(target: &mut Vec<V>, change: &Change<K, V>)
where
    V: Clone + PartialEq,
{
    match change {
        Change::Add { current, .. } => target.push(current.clone()),
        Change::Update {
            current, previous, ..
        } => match target.iter().position(|v| v == previous) {
            Some(pos) => target[pos] = current.clone(),
            None => target.push(current.clone()),
        },
        Change::Remove { current, .. } => {
            if let Some(pos) = target.iter().position(|v| v == current) {
                target.remove(pos);
            }
        }
        Change::Refresh { current, .. } => {
            if let Some(pos) = target.iter().position(|v| v == current) {
                target[pos] = current.clone();
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
    use crate::cache::SourceCache;
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

    #[test]
    fn add_appends_in_batch_order() {
        let cache = make_cache();
        let target = Arc::new(Mutex::new(Vec::new()));
        let collector = Collector::new();
        let _sub = cache
            .connect()
            .bind(Arc::clone(&target))
            .subscribe(collector.observer());

        cache.add_or_update(person("alice", 30));
        cache.add_or_update(person("bob", 40));

        assert_eq!(*target.lock(), vec![person("alice", 30), person("bob", 40)]);
        // Pass-through: downstream still sees the raw batches.
        assert_eq!(collector.batches().len(), 2);
    }

    #[test]
    fn update_replaces_matching_element() {
        let cache = make_cache();
        let target = Arc::new(Mutex::new(Vec::new()));
        let _sub = cache.connect().bind(Arc::clone(&target)).subscribe_fn(|_| {});

        cache.add_or_update(person("alice", 30));
        cache.add_or_update(person("bob", 40));
        cache.add_or_update(person("alice", 31));

        assert_eq!(*target.lock(), vec![person("alice", 31), person("bob", 40)]);
    }

    #[test]
    fn remove_deletes_matching_element() {
        let cache = make_cache();
        let target = Arc::new(Mutex::new(Vec::new()));
        let _sub = cache.connect().bind(Arc::clone(&target)).subscribe_fn(|_| {});

        cache.add_or_update_many([person("alice", 30), person("bob", 40)]);
        cache.remove(&"alice".to_string());

        assert_eq!(*target.lock(), vec![person("bob", 40)]);
    }

    #[test]
    fn batch_add_and_clear() {
        let cache = make_cache();
        let target = Arc::new(Mutex::new(Vec::new()));
        let _sub = cache.connect().bind(Arc::clone(&target)).subscribe_fn(|_| {});

        cache.add_or_update_many((0..100).map(|i| person(&format!("p{i}"), i)));
        assert_eq!(target.lock().len(), 100);

        cache.clear();
        assert!(target.lock().is_empty());
    }

    #[test]
    fn snapshot_populates_target() {
        let cache = make_cache();
        cache.add_or_update_many([person("a", 1), person("b", 2)]);

        let target = Arc::new(Mutex::new(Vec::new()));
        let _sub = cache.connect().bind(Arc::clone(&target)).subscribe_fn(|_| {});

        assert_eq!(target.lock().len(), 2);
    }

    #[test]
    fn contents_track_cache_as_a_set() {
        let cache = make_cache();
        let target = Arc::new(Mutex::new(Vec::new()));
        let _sub = cache.connect().bind(Arc::clone(&target)).subscribe_fn(|_| {});

        cache.add_or_update_many([person("a", 1), person("b", 2), person("c", 3)]);
        cache.remove(&"b".to_string());
        cache.add_or_update(person("a", 9));

        let mut held: Vec<Person> = target.lock().clone();
        let mut expected: Vec<Person> = cache.keys().iter().filter_map(|k| cache.get(k)).collect();
        held.sort_by(|x, y| x.name.cmp(&y.name));
        expected.sort_by(|x, y| x.name.cmp(&y.name));
        assert_eq!(held, expected);
    }
}
