//! Key-value backend contract
//!
//! Provides the [`Store`] trait consumed by cells and migrations, a
//! concurrent in-memory backend and the never-failing [`SafeStore`]
//! decorator.

use crate::error::StoreError;
use dashmap::DashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

/// Key-value backend
///
/// Implementations are shared between cells and worker threads, so they must
/// be `Send + Sync`. Any internal state is the implementation's own
/// responsibility.
pub trait Store<K, V>: Send + Sync {
    /// Check whether an entry exists for `key`
    ///
    /// Must not fail; backends that cannot tell should answer `false`.
    fn contains(&self, key: &K) -> bool;

    /// Load the entry for `key`, `None` when absent
    ///
    /// # Errors
    /// Returns `StoreError` when the backend cannot be read.
    fn load(&self, key: &K) -> Result<Option<V>, StoreError>;

    /// Write the entry for `key`; `None` removes it
    ///
    /// # Errors
    /// Returns `StoreError` when the backend cannot be written.
    fn store(&self, key: &K, value: Option<&V>) -> Result<(), StoreError>;
}

impl<K, V, S> Store<K, V> for Arc<S>
where
    S: Store<K, V> + ?Sized,
{
    #[inline]
    fn contains(&self, key: &K) -> bool {
        (**self).contains(key)
    }

    #[inline]
    fn load(&self, key: &K) -> Result<Option<V>, StoreError> {
        (**self).load(key)
    }

    #[inline]
    fn store(&self, key: &K, value: Option<&V>) -> Result<(), StoreError> {
        (**self).store(key, value)
    }
}

/// Concurrent in-memory backend
#[derive(Debug)]
pub struct MemoryStore<K, V>
where
    K: Eq + Hash,
{
    entries: DashMap<K, V>,
}

impl<K, V> MemoryStore<K, V>
where
    K: Eq + Hash,
{
    /// Create empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Number of entries
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if store is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert an entry directly, bypassing any cell
    #[inline]
    pub fn insert(&self, key: K, value: V) {
        self.entries.insert(key, value);
    }
}

impl<K, V> MemoryStore<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Read an entry directly, bypassing any cell
    #[inline]
    #[must_use]
    pub fn peek(&self, key: &K) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }
}

impl<K, V> Default for MemoryStore<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Store<K, V> for MemoryStore<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    fn load(&self, key: &K) -> Result<Option<V>, StoreError> {
        Ok(self.peek(key))
    }

    fn store(&self, key: &K, value: Option<&V>) -> Result<(), StoreError> {
        match value {
            Some(value) => {
                self.entries.insert(key.clone(), value.clone());
            }
            None => {
                self.entries.remove(key);
            }
        }
        Ok(())
    }
}

/// Store decorator that never fails
///
/// Load failures read as absent and write failures are dropped; both are
/// logged.
#[derive(Debug, Clone)]
pub struct SafeStore<S> {
    inner: S,
}

impl<S> SafeStore<S> {
    /// Wrap a store
    #[inline]
    #[must_use]
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    /// Get wrapped store
    #[inline]
    #[must_use]
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<K, V, S> Store<K, V> for SafeStore<S>
where
    K: Debug,
    S: Store<K, V>,
{
    fn contains(&self, key: &K) -> bool {
        self.inner.contains(key)
    }

    fn load(&self, key: &K) -> Result<Option<V>, StoreError> {
        match self.inner.load(key) {
            Ok(value) => Ok(value),
            Err(error) => {
                tracing::warn!(key = ?key, error = %error, "load failed, reading as absent");
                Ok(None)
            }
        }
    }

    fn store(&self, key: &K, value: Option<&V>) -> Result<(), StoreError> {
        if let Err(error) = self.inner.store(key, value) {
            tracing::warn!(key = ?key, error = %error, "store failed, write dropped");
        }
        Ok(())
    }
}
