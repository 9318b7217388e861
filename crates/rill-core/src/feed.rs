//! Raw value feed.
//!
//! A [`Feed`] is a plain push source: values in, no keys, no change model.
//! It serves two roles. A `Feed<bool>` drives the pause gate
//! ([`Connection::batch_if`](crate::connect::Connection)), and
//! [`FeedConnection::into_change_stream`] lifts any feed into a keyed
//! change stream with an optional size bound, so unkeyed telemetry can join
//! the operator pipeline.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::change::{Change, ChangeSet};
use crate::connect::{Connection, Slot, Subscription};

// ---------------------------------------------------------------------------
// ValueObserver
// ---------------------------------------------------------------------------

/// Consumer of raw feed values.
pub trait ValueObserver<T>: Send {
    /// Called for each pushed value, in push order.
    fn on_value(&mut self, value: &T);

    /// Called once when the feed completes.
    fn on_completed(&mut self) {}
}

struct FnValueObserver<F>(F);

impl<T, F> ValueObserver<T> for FnValueObserver<F>
where
    F: FnMut(&T) + Send,
{
    fn on_value(&mut self, value: &T) {
        (self.0)(value);
    }
}

// ---------------------------------------------------------------------------
// ValueSlot
// ---------------------------------------------------------------------------

/// Observer cell for one feed subscriber, same take-out discipline as the
/// change-stream slot.
pub(crate) struct ValueSlot<T> {
    inner: Arc<Mutex<ValueSlotState<T>>>,
}

struct ValueSlotState<T> {
    observer: Option<Box<dyn ValueObserver<T>>>,
    open: bool,
}

impl<T> Clone for ValueSlot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> ValueSlot<T> {
    pub(crate) fn new(observer: Box<dyn ValueObserver<T>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ValueSlotState {
                observer: Some(observer),
                open: true,
            })),
        }
    }

    pub(crate) fn deliver(&self, value: &T) {
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
        observer.on_value(value);
        let mut state = self.inner.lock();
        if state.open {
            state.observer = Some(observer);
        }
    }

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

    pub(crate) fn close(&self) {
        let mut state = self.inner.lock();
        state.open = false;
        state.observer = None;
    }
}

// ---------------------------------------------------------------------------
// Feed
// ---------------------------------------------------------------------------

/// Push source of raw values with fan-out to any number of subscribers.
///
/// Completes every subscriber when [`Feed::complete`] is called or the feed
/// is dropped. Values pushed before a subscriber connects are not replayed.
pub struct Feed<T> {
    inner: Arc<FeedInner<T>>,
}

struct FeedInner<T> {
    /// Serializes push and completion against subscriber registration.
    publish: Mutex<()>,
    state: Mutex<FeedState<T>>,
}

struct FeedState<T> {
    subscribers: Vec<(u64, ValueSlot<T>)>,
    next_subscriber: u64,
    done: bool,
}

impl<T> Feed<T>
where
    T: Clone + Send + 'static,
{
    /// Creates a feed with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FeedInner {
                publish: Mutex::new(()),
                state: Mutex::new(FeedState {
                    subscribers: Vec::new(),
                    next_subscriber: 0,
                    done: false,
                }),
            }),
        }
    }

    /// Pushes one value to every current subscriber.
    pub fn push(&self, value: T) {
        let _publish = self.inner.publish.lock();
        let slots: Vec<ValueSlot<T>> = {
            let state = self.inner.state.lock();
            if state.done {
                return;
            }
            state.subscribers.iter().map(|(_, s)| s.clone()).collect()
        };
        for slot in slots {
            slot.deliver(&value);
        }
    }

    /// Completes every subscriber; later pushes are ignored.
    pub fn complete(&self) {
        self.inner.finish();
    }

    /// Opens a single-use subscription point on this feed.
    #[must_use]
    pub fn connect(&self) -> FeedConnection<T> {
        let inner = Arc::clone(&self.inner);
        FeedConnection {
            subscribe_with: Box::new(move |slot| {
                let _publish = inner.publish.lock();
                let id = {
                    let mut state = inner.state.lock();
                    if state.done {
                        None
                    } else {
                        let id = state.next_subscriber;
                        state.next_subscriber += 1;
                        state.subscribers.push((id, slot.clone()));
                        Some(id)
                    }
                };
                match id {
                    None => {
                        slot.complete();
                        Subscription::empty()
                    }
                    Some(id) => {
                        let weak = Arc::downgrade(&inner);
                        Subscription::new(move || {
                            if let Some(strong) = weak.upgrade() {
                                strong
                                    .state
                                    .lock()
                                    .subscribers
                                    .retain(|(sid, _)| *sid != id);
                            }
                            slot.close();
                        })
                    }
                }
            }),
        }
    }
}

impl<T> Default for Feed<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FeedInner<T> {
    fn finish(&self) {
        let _publish = self.publish.lock();
        let slots = {
            let mut state = self.state.lock();
            if state.done {
                return;
            }
            state.done = true;
            std::mem::take(&mut state.subscribers)
        };
        for (_, slot) in slots {
            slot.complete();
        }
    }
}

impl<T> Drop for Feed<T> {
    fn drop(&mut self) {
        self.inner.finish();
    }
}

// ---------------------------------------------------------------------------
// FeedConnection
// ---------------------------------------------------------------------------

/// Single-use subscription point on a [`Feed`].
pub struct FeedConnection<T> {
    subscribe_with: Box<dyn FnOnce(ValueSlot<T>) -> Subscription + Send>,
}

impl<T> FeedConnection<T>
where
    T: Clone + Send + 'static,
{
    /// Builds a connection from a producer-side subscribe action.
    pub(crate) fn from_subscribe(
        subscribe_with: impl FnOnce(ValueSlot<T>) -> Subscription + Send + 'static,
    ) -> Self {
        Self {
            subscribe_with: Box::new(subscribe_with),
        }
    }

    /// Subscribes an observer, consuming the connection.
    pub fn subscribe<O>(self, observer: O) -> Subscription
    where
        O: ValueObserver<T> + 'static,
    {
        (self.subscribe_with)(ValueSlot::new(Box::new(observer)))
    }

    /// Subscribes a closure invoked for each value.
    pub fn subscribe_fn<F>(self, f: F) -> Subscription
    where
        F: FnMut(&T) + Send + 'static,
    {
        self.subscribe(FnValueObserver(f))
    }

    /// Lifts the feed into a keyed change stream.
    ///
    /// Each arrival gets a monotone `u64` key and emits one batch holding
    /// its Add plus, when a bound is given and exceeded, the Removes of the
    /// oldest keys. Eviction is synchronous: the projection never holds
    /// more than `limit` keys between batches.
    #[must_use]
    pub fn into_change_stream(self, limit: Option<NonZeroUsize>) -> Connection<u64, T> {
        Connection::from_subscribe(move |down: Slot<u64, T>| {
            let closer = down.clone();
            let sub = self.subscribe(WindowObserver {
                next_key: 0,
                window: VecDeque::new(),
                limit,
                down,
            });
            Subscription::new(move || {
                sub.dispose();
                closer.close();
            })
        })
    }
}

impl<T> std::fmt::Debug for FeedConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedConnection").finish_non_exhaustive()
    }
}

/// Keys arrivals and maintains the bounded window.
struct WindowObserver<T> {
    next_key: u64,
    window: VecDeque<(u64, T)>,
    limit: Option<NonZeroUsize>,
    down: Slot<u64, T>,
}

impl<T> ValueObserver<T> for WindowObserver<T>
where
    T: Clone + Send + 'static,
{
    fn on_value(&mut self, value: &T) {
        let key = self.next_key;
        self.next_key += 1;
        self.window.push_back((key, value.clone()));

        let mut batch = ChangeSet::new();
        batch.push(Change::Add {
            key,
            current: value.clone(),
        });
        if let Some(limit) = self.limit {
            while self.window.len() > limit.get() {
                if let Some((old_key, old_value)) = self.window.pop_front() {
                    batch.push(Change::Remove {
                        key: old_key,
                        current: old_value,
                    });
                }
            }
        }
        self.down.deliver(&batch);
    }

    fn on_completed(&mut self) {
        self.down.complete();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
