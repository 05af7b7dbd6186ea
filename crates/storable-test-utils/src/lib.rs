//! Testing utilities for storable workspace
//!
//! Instrumented stores, fault injection and tracing setup.

#![allow(missing_docs)]

use parking_lot::Mutex;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storable_store::{MemoryStore, Store, StoreError};

/// Install a test subscriber honouring `RUST_LOG`; repeated calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Memory store that counts every call and can be made to fail
#[derive(Debug)]
pub struct CountingStore<K, V>
where
    K: Eq + Hash,
{
    entries: MemoryStore<K, V>,
    contains_calls: AtomicUsize,
    loads: AtomicUsize,
    stores: AtomicUsize,
    fail_loads: AtomicBool,
    fail_stores: AtomicBool,
    load_delay: Mutex<Option<Duration>>,
}

impl<K, V> CountingStore<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            entries: MemoryStore::new(),
            contains_calls: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
            stores: AtomicUsize::new(0),
            fail_loads: AtomicBool::new(false),
            fail_stores: AtomicBool::new(false),
            load_delay: Mutex::new(None),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Seed an entry without counting it
    pub fn seed(&self, key: K, value: V) {
        self.entries.insert(key, value);
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn stores(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }

    pub fn contains_calls(&self) -> usize {
        self.contains_calls.load(Ordering::SeqCst)
    }

    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_stores(&self, fail: bool) {
        self.fail_stores.store(fail, Ordering::SeqCst);
    }

    /// Block every load for `delay` on the calling thread
    pub fn delay_loads(&self, delay: Duration) {
        *self.load_delay.lock() = Some(delay);
    }
}

impl<K, V> CountingStore<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn peek(&self, key: &K) -> Option<V> {
        self.entries.peek(key)
    }
}

impl<K, V> Default for CountingStore<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Store<K, V> for CountingStore<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync,
    V: Clone + Send + Sync,
{
    fn contains(&self, key: &K) -> bool {
        self.contains_calls.fetch_add(1, Ordering::SeqCst);
        self.entries.contains(key)
    }

    fn load(&self, key: &K) -> Result<Option<V>, StoreError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let delay = *self.load_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StoreError::load(key, "injected load failure"));
        }
        self.entries.load(key)
    }

    fn store(&self, key: &K, value: Option<&V>) -> Result<(), StoreError> {
        self.stores.fetch_add(1, Ordering::SeqCst);
        if self.fail_stores.load(Ordering::SeqCst) {
            return Err(StoreError::write(key, "injected write failure"));
        }
        self.entries.store(key, value)
    }
}

/// Store that fails every operation
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingStore;

impl<K, V> Store<K, V> for FailingStore
where
    K: Debug,
{
    fn contains(&self, _key: &K) -> bool {
        false
    }

    fn load(&self, key: &K) -> Result<Option<V>, StoreError> {
        Err(StoreError::load(key, "backend offline"))
    }

    fn store(&self, key: &K, _value: Option<&V>) -> Result<(), StoreError> {
        Err(StoreError::write(key, "backend offline"))
    }
}

/// Unique key for a test
pub fn test_key(name: &str) -> String {
    format!("test/{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_calls() {
        let store = CountingStore::<String, u8>::new();
        let key = test_key("count");
        store.seed(key.clone(), 1);

        assert!(store.contains(&key));
        assert_eq!(store.load(&key).unwrap(), Some(1));
        store.store(&key, Some(&2)).unwrap();

        assert_eq!(store.contains_calls(), 1);
        assert_eq!(store.loads(), 1);
        assert_eq!(store.stores(), 1);
        assert_eq!(store.peek(&key), Some(2));
    }

    #[test]
    fn injected_failures() {
        let store = CountingStore::<String, u8>::new();
        store.fail_loads(true);
        store.fail_stores(true);
        let key = test_key("fail");

        assert!(store.load(&key).is_err());
        assert!(store.store(&key, Some(&1)).is_err());
        assert_eq!(store.peek(&key), None);
    }

    #[test]
    fn failing_store_fails() {
        let store = FailingStore;
        let result: Result<Option<u8>, _> = store.load(&"k");
        assert!(result.is_err());
        init_tracing();
        init_tracing();
    }
}
