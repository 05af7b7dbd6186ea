//! Storable Cache
//!
//! A reference-counted shared upstream with replay of the latest value and
//! delayed eviction. Concurrent observers of one key share a single backend
//! read; a short grace period keeps the result around between bursts.
//!
//! # Lifecycle
//!
//! 1. First [`DelayedRefCountCache::subscribe`] starts a generation and calls
//!    `connect` with a [`Publisher`]
//! 2. Values published into the generation fan out to every [`Subscription`]
//!    and become the replay entry for late subscribers
//! 3. When the last subscription drops, the generation is evicted after the
//!    grace period unless a subscriber arrives in between
//! 4. [`Publisher::complete`] or [`DelayedRefCountCache::retire`] end the
//!    generation immediately

#![warn(unreachable_pub)]
#![warn(missing_docs)]

mod cache;
mod connection;

pub use cache::{CacheStats, CachedEntry, DelayedRefCountCache, Publisher, Subscription};
pub use connection::Connection;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
