//! Connection contract — how batches reach consumers.
//!
//! An [`Observer`] receives ordered [`ChangeSet`]s followed by exactly one
//! terminal signal: completion (the producer finished) or a fault. A
//! [`Connection`] is a single-use subscription point: every producer and
//! every operator hands one out, and subscribing yields a [`Subscription`]
//! that unwinds the whole chain when disposed.
//!
//! # Ordering
//!
//! Producers serialize delivery: an observer never receives a new batch
//! while it is still processing the previous one, and batches arrive in
//! production order.
//!
//! # Re-entrancy
//!
//! Disposing a subscription from inside its own callback is supported.
//! Calling back into the producing cache from `on_changes` is not, and the
//! same holds for an operator's inputs: a downstream callback must not
//! push to the control feed of a `batch_if` gate or mutate a source
//! feeding the `combine` it is observing, since delivery runs under the
//! operator's state lock.

use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::change::ChangeSet;

// ---------------------------------------------------------------------------
// StreamFault
// ---------------------------------------------------------------------------

/// Terminal fault carried on a connection.
///
/// A fault ends the stream for the subscriber that receives it; the
/// producing cache upstream is unaffected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct StreamFault {
    message: String,
}

impl StreamFault {
    /// Creates a fault with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The fault message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

/// Consumer of a change stream.
///
/// `on_fault` and `on_completed` are terminal: nothing is delivered after
/// either, and at most one of them is ever invoked.
pub trait Observer<K, V>: Send {
    /// Called for each batch, in production order.
    fn on_changes(&mut self, changes: &ChangeSet<K, V>);

    /// Called once if the stream ends with a fault.
    fn on_fault(&mut self, fault: &StreamFault) {
        let _ = fault;
    }

    /// Called once when the producer completes.
    fn on_completed(&mut self) {}
}

/// Adapter wrapping a closure into an [`Observer`].
struct FnObserver<F>(F);

impl<K, V, F> Observer<K, V> for FnObserver<F>
where
    F: FnMut(&ChangeSet<K, V>) + Send,
{
    fn on_changes(&mut self, changes: &ChangeSet<K, V>) {
        (self.0)(changes);
    }
}

// ---------------------------------------------------------------------------
// Slot (internal observer cell)
// ---------------------------------------------------------------------------

/// Shared cell holding one downstream observer.
///
/// The observer is taken out of the lock for the duration of each callback,
/// so a callback may dispose its own subscription without deadlocking. Once
/// closed (terminal signal or disposal) the slot drops the observer and
/// ignores everything else.
pub(crate) struct Slot<K, V> {
    inner: Arc<Mutex<SlotState<K, V>>>,
}

struct SlotState<K, V> {
    observer: Option<Box<dyn Observer<K, V>>>,
    open: bool,
}

impl<K, V> Clone for Slot<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Slot<K, V> {
    pub(crate) fn new(observer: Box<dyn Observer<K, V>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SlotState {
                observer: Some(observer),
                open: true,
            })),
        }
    }

    /// Delivers a batch if the slot is still open.
    pub(crate) fn deliver(&self, changes: &ChangeSet<K, V>) {
        let mut observer = {
            let mut state = self.inner.lock();
            if !state.open {
                return;
            }
            match state.observer.take() {
                Some(observer) => observer,
                None => return,
            }
        };
        observer.on_changes(changes);
        let mut state = self.inner.lock();
        if state.open {
            state.observer = Some(observer);
        }
    }

    /// Closes the slot with a terminal fault.
    pub(crate) fn fault(&self, fault: &StreamFault) {
        let observer = {
            let mut state = self.inner.lock();
            state.open = false;
            state.observer.take()
        };
        if let Some(mut observer) = observer {
            observer.on_fault(fault);
        }
    }

    /// Closes the slot with completion.
    pub(crate) fn complete(&self) {
        let observer = {
            let mut state = self.inner.lock();
            state.open = false;
            state.observer.take()
        };
        if let Some(mut observer) = observer {
            observer.on_completed();
        }
    }

    /// Closes the slot silently, dropping the observer.
    pub(crate) fn close(&self) {
        let observer = {
            let mut state = self.inner.lock();
            state.open = false;
            state.observer.take()
        };
        drop(observer);
    }

    /// Whether the slot can still receive signals.
    pub(crate) fn is_open(&self) -> bool {
        self.inner.lock().open
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Disposal handle for a live subscription.
///
/// Disposing synchronously unwinds every resource the subscription owns
/// (buffered batches, scheduled callbacks, per-item handles) and detaches
/// the observer. Disposal is idempotent and also runs on drop. A cleanup
/// that panics is contained and logged; remaining cleanup still runs.
pub struct Subscription {
    cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wraps a cleanup action into a subscription handle.
    ///
    /// Useful for tying an arbitrary resource to a stream's item lifetime,
    /// e.g. from a `subscribe_each` factory.
    pub fn new(cleanup: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cleanup: Some(Box::new(cleanup)),
        }
    }

    /// A subscription with nothing to release.
    #[must_use]
    pub fn empty() -> Self {
        Self { cleanup: None }
    }

    /// Disposes the subscription, releasing everything it owns.
    pub fn dispose(mut self) {
        self.run_cleanup();
    }

    /// Combines two handles into one that disposes both.
    #[must_use]
    pub fn join(self, other: Subscription) -> Subscription {
        Subscription::new(move || {
            self.dispose();
            other.dispose();
        })
    }

    fn run_cleanup(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            if catch_unwind(AssertUnwindSafe(cleanup)).is_err() {
                tracing::warn!("subscription cleanup panicked; continuing");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_cleanup();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("disposed", &self.cleanup.is_none())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A single-use subscription point for a change stream.
///
/// A connection is bound to exactly one downstream observer: subscribing
/// consumes it. If the producer already holds items, one initial batch of
/// `Add`s is delivered synchronously before any live batch. Operators are
/// methods that consume a connection and return a new one, so arbitrary
/// chains compose.
pub struct Connection<K, V> {
    subscribe_with: Box<dyn FnOnce(Slot<K, V>) -> Subscription + Send>,
}

impl<K, V> Connection<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Builds a connection from a producer-side subscribe action.
    pub(crate) fn from_subscribe(
        subscribe_with: impl FnOnce(Slot<K, V>) -> Subscription + Send + 'static,
    ) -> Self {
        Self {
            subscribe_with: Box::new(subscribe_with),
        }
    }

    /// Subscribes an observer, consuming the connection.
    pub fn subscribe<O>(self, observer: O) -> Subscription
    where
        O: Observer<K, V> + 'static,
    {
        (self.subscribe_with)(Slot::new(Box::new(observer)))
    }

    /// Subscribes a closure invoked for each batch.
    pub fn subscribe_fn<F>(self, f: F) -> Subscription
    where
        F: FnMut(&ChangeSet<K, V>) + Send + 'static,
    {
        self.subscribe(FnObserver(f))
    }
}

impl<K, V> std::fmt::Debug for Connection<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
