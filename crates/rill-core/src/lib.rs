//! In-memory keyed collection engine with composable change-set operators.
//!
//! A [`SourceCache`] owns a keyed collection and emits one ordered
//! [`ChangeSet`] batch per mutation. Connections observe those batches and
//! operators derive live views from them: set algebra across several
//! caches, pause/resume and time-interval batching, bounded-size eviction,
//! per-item resource lifecycles, ordered `Vec` projection, whole-collection
//! query snapshots and per-value transforms. Delivery is synchronous on the
//! mutating thread; the only scheduling boundary is the injected [`Clock`].
//!
//! ```
//! use rill_core::SourceCache;
//!
//! let cache: SourceCache<&str, (&str, u32)> = SourceCache::new(|v: &(&str, u32)| v.0);
//! let seen = std::sync::Arc::new(parking_lot::Mutex::new(0_usize));
//!
//! let sink = std::sync::Arc::clone(&seen);
//! let _sub = cache
//!     .connect()
//!     .transform(|v| v.1)
//!     .subscribe_fn(move |changes| *sink.lock() += changes.len());
//!
//! cache.add_or_update(("a", 1));
//! cache.add_or_update(("b", 2));
//! assert_eq!(*seen.lock(), 2);
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod change;
pub mod clock;
pub mod connect;
pub mod feed;
pub mod op;

#[cfg(test)]
pub(crate) mod testkit;

pub use cache::{Editor, SourceCache};
pub use change::{Change, ChangeSet};
pub use clock::{Clock, ScheduleHandle, SystemClock, VirtualClock};
pub use connect::{Connection, Observer, StreamFault, Subscription};
pub use feed::{Feed, FeedConnection, ValueObserver};
pub use op::combine::CombineRule;
pub use op::query::Query;

/// Errors surfaced at construction or carried terminally on a connection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A size cap must admit at least one entry.
    #[error("size limit must be at least 1, got {limit}")]
    InvalidLimit {
        /// The rejected limit.
        limit: usize,
    },

    /// Combining requires at least two connections.
    #[error("combining requires at least two sources, got {count}")]
    NotEnoughSources {
        /// How many connections were supplied, including the receiver.
        count: usize,
    },

    /// A stream ended with a terminal fault.
    #[error(transparent)]
    Fault(#[from] StreamFault),
}

/// Convenience alias for crate results.
pub type Result<T> = std::result::Result<T, Error>;
