//! Reactive accessor for one persisted entry
//!
//! A [`Cell`] migrates its key once before the first backend read, converts
//! between object and stored form, coalesces concurrent reads through a
//! [`DelayedRefCountCache`] and republishes every completed write to its
//! observers.

use crate::error::{CellError, CellResult, ExecutorError};
use crate::executor::{submit, Executor};
use crate::settings::MigrationFailurePolicy;
use crate::strategy::ObserveStrategy;
use crate::validator::Validator;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use storable_cache::{CacheStats, Connection, DelayedRefCountCache, Publisher, Subscription};
use storable_migration::Migration;
use storable_store::{deep_equals, Converter, Store};
use tokio::runtime::Handle;
use tokio::sync::broadcast::{self, error::RecvError};

/// Bounds of a cell key
pub trait CellKey: Clone + Debug + Send + Sync + 'static {}
impl<K> CellKey for K where K: Clone + Debug + Send + Sync + 'static {}

/// Bounds of an object value
pub trait ObjectValue: Clone + PartialEq + Send + Sync + 'static {}
impl<T> ObjectValue for T where T: Clone + PartialEq + Send + Sync + 'static {}

/// Bounds of a stored value
pub trait StoredValue: Clone + Send + Sync + 'static {}
impl<S> StoredValue for S where S: Clone + Send + Sync + 'static {}

const WRITE_CHANNEL_CAPACITY: usize = 64;

type StoredItem<S> = CellResult<Option<S>>;
type ObjectItem<T> = CellResult<Option<T>>;

/// Where observations get their values
enum ReadLayer<T, S> {
    Direct,
    Stored(DelayedRefCountCache<StoredItem<S>>),
    Actual(DelayedRefCountCache<ObjectItem<T>>),
}

impl<T, S> ReadLayer<T, S>
where
    T: ObjectValue,
    S: StoredValue,
{
    fn subscribe_stored(&self) -> Option<Subscription<StoredItem<S>>> {
        match self {
            Self::Stored(cache) => Some(cache.subscribe()),
            _ => None,
        }
    }

    fn subscribe_actual(&self) -> Option<Subscription<ObjectItem<T>>> {
        match self {
            Self::Actual(cache) => Some(cache.subscribe()),
            _ => None,
        }
    }

    fn invalidate(&self) {
        match self {
            Self::Direct => {}
            Self::Stored(cache) => cache.invalidate(),
            Self::Actual(cache) => cache.invalidate(),
        }
    }

    fn retire(&self) {
        match self {
            Self::Direct => {}
            Self::Stored(cache) => {
                cache.retire();
            }
            Self::Actual(cache) => {
                cache.retire();
            }
        }
    }

    fn publish(&self, stored: &Option<S>, object: &Option<T>) {
        match self {
            Self::Direct => {}
            Self::Stored(cache) => {
                cache.publish(Ok(stored.clone()));
            }
            Self::Actual(cache) => {
                cache.publish(Ok(object.clone()));
            }
        }
    }

    fn stats(&self) -> Option<CacheStats> {
        match self {
            Self::Direct => None,
            Self::Stored(cache) => Some(cache.stats()),
            Self::Actual(cache) => Some(cache.stats()),
        }
    }
}

/// Progress of the one-time migration of a cell's key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MigrationState {
    Pending,
    Current,
    /// Migration stopped below latest or its failure was tolerated
    Behind,
}

/// Fails a generation whose load job ends without publishing
///
/// Covers jobs that panic and jobs an executor drops unrun.
struct LoadGuard<V>
where
    V: Clone + Send + 'static,
{
    publisher: Option<Publisher<CellResult<V>>>,
}

impl<V> LoadGuard<V>
where
    V: Clone + Send + 'static,
{
    fn disarm(mut self) -> Option<Publisher<CellResult<V>>> {
        self.publisher.take()
    }
}

impl<V> Drop for LoadGuard<V>
where
    V: Clone + Send + 'static,
{
    fn drop(&mut self) {
        if let Some(publisher) = self.publisher.take() {
            publisher.publish(Err(ExecutorError::Dropped.into()));
            publisher.complete();
        }
    }
}

/// Everything a cell is built from
pub(crate) struct CellParts<K, T, S> {
    pub(crate) key: K,
    pub(crate) store: Arc<dyn Store<K, S>>,
    pub(crate) converter: Arc<dyn Converter<T, S>>,
    pub(crate) default: Option<T>,
    pub(crate) migration: Option<Arc<Migration<K>>>,
    pub(crate) migration_failure: MigrationFailurePolicy,
    pub(crate) validator: Option<Arc<dyn Validator<T>>>,
    pub(crate) strategy: ObserveStrategy,
    pub(crate) grace_period: Duration,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) runtime: Option<Handle>,
}

struct CellInner<K, T, S> {
    key: K,
    store: Arc<dyn Store<K, S>>,
    converter: Arc<dyn Converter<T, S>>,
    default: Option<T>,
    migration: Option<Arc<Migration<K>>>,
    migration_failure: MigrationFailurePolicy,
    migration_state: Mutex<MigrationState>,
    validator: Option<Arc<dyn Validator<T>>>,
    strategy: ObserveStrategy,
    executor: Arc<dyn Executor>,
    writes: broadcast::Sender<()>,
    /// Completed writes, bumped between storing and publishing
    write_epoch: AtomicU64,
    layer: ReadLayer<T, S>,
}

impl<K, T, S> CellInner<K, T, S>
where
    K: CellKey,
    T: ObjectValue,
    S: StoredValue,
{
    /// Migrate once; a propagated failure is retried by the next read
    fn ensure_migrated(&self) -> CellResult<()> {
        let Some(migration) = &self.migration else {
            return Ok(());
        };

        let mut state = self.migration_state.lock();
        if *state != MigrationState::Pending {
            return Ok(());
        }

        match migration.migrate_to_latest_version(&self.key) {
            Ok(outcome) => {
                tracing::debug!(
                    key = ?self.key,
                    from = outcome.from,
                    to = outcome.to,
                    steps = outcome.steps,
                    "cell migrated"
                );
                *state = if outcome.is_current() {
                    MigrationState::Current
                } else {
                    MigrationState::Behind
                };
                Ok(())
            }
            Err(error) => match self.migration_failure {
                MigrationFailurePolicy::Propagate => Err(error.into()),
                MigrationFailurePolicy::LogAndContinue => {
                    tracing::warn!(key = ?self.key, error = %error, "migration failed, reading recorded version");
                    *state = MigrationState::Behind;
                    Ok(())
                }
            },
        }
    }

    /// After a write in the latest format, record the key as current
    ///
    /// A failure only costs a repeated attempt on the next write.
    fn mark_written_current(&self) {
        let Some(migration) = &self.migration else {
            return;
        };

        let mut state = self.migration_state.lock();
        if *state != MigrationState::Behind {
            return;
        }
        match migration.record_latest_version(&self.key) {
            Ok(()) => *state = MigrationState::Current,
            Err(error) => {
                tracing::warn!(key = ?self.key, error = %error, "could not record latest version after write");
            }
        }
    }

    fn read_stored(&self) -> StoredItem<S> {
        self.ensure_migrated()?;
        Ok(self.store.load(&self.key)?)
    }

    fn read_object(&self) -> ObjectItem<T> {
        let stored = self.read_stored()?;
        Ok(self.converter.to_object(stored.as_ref())?)
    }

    fn write_through(&self, value: Option<T>) -> CellResult<()> {
        self.ensure_migrated()?;
        let stored = self.converter.to_stored(value.as_ref())?;
        self.store.store(&self.key, stored.as_ref())?;
        self.write_epoch.fetch_add(1, Ordering::AcqRel);
        self.mark_written_current();

        self.layer.publish(&stored, &value);
        // No receivers just means no uncached observers
        let _ = self.writes.send(());
        tracing::debug!(key = ?self.key, present = value.is_some(), "cell written");
        Ok(())
    }

    fn resolve(&self, value: Option<T>) -> Option<T> {
        value.or_else(|| self.default.clone())
    }

    async fn load_object(self: Arc<Self>) -> ObjectItem<T> {
        let inner = self.clone();
        flatten(submit(self.executor.as_ref(), move || inner.read_object()).await)
    }

    async fn convert_stored(self: Arc<Self>, item: StoredItem<S>) -> ObjectItem<T> {
        let stored = item?;
        let inner = self.clone();
        flatten(
            submit(self.executor.as_ref(), move || -> ObjectItem<T> {
                Ok(inner.converter.to_object(stored.as_ref())?)
            })
            .await,
        )
    }

    /// Start the upstream of a new cache generation
    ///
    /// A load overtaken by a completed write is discarded; that write has
    /// already published a newer value into the generation.
    fn connect<V, F>(self: Arc<Self>, publisher: Publisher<CellResult<V>>, read: F) -> Connection
    where
        V: Clone + Send + 'static,
        F: FnOnce(&Self) -> CellResult<V> + Send + 'static,
    {
        tracing::debug!(key = ?self.key, generation = publisher.generation(), "loading cell");
        let guard = LoadGuard {
            publisher: Some(publisher),
        };
        let epoch = self.write_epoch.load(Ordering::Acquire);
        let inner = self.clone();
        let submitted = self.executor.execute(Box::new(move || {
            let result = read(&inner);
            let Some(publisher) = guard.disarm() else {
                return;
            };
            if inner.write_epoch.load(Ordering::Acquire) != epoch {
                tracing::debug!(key = ?inner.key, generation = publisher.generation(), "load overtaken by write, discarded");
                return;
            }
            let failed = result.is_err();
            publisher.publish(result);
            if failed {
                publisher.complete();
            }
        }));

        if let Err(error) = submitted {
            // The rejected job dropped its guard, which failed the generation
            tracing::debug!(key = ?self.key, error = %error, "load job rejected");
        }
        Connection::none()
    }
}

fn with_timer_runtime<V>(cache: DelayedRefCountCache<V>, runtime: Option<Handle>) -> DelayedRefCountCache<V>
where
    V: Clone + Send + 'static,
{
    match runtime {
        Some(runtime) => cache.with_runtime(runtime),
        None => cache,
    }
}

fn flatten<R>(result: Result<CellResult<R>, crate::error::ExecutorError>) -> CellResult<R> {
    result.map_err(CellError::from).and_then(|inner| inner)
}

/// Keep a subscription to the live generation, resubscribing when one ends
fn resubscribing<V, F>(subscribe: F) -> impl Stream<Item = V> + Send
where
    V: Clone + Send + 'static,
    F: Fn() -> Option<Subscription<V>> + Send + 'static,
{
    stream::unfold(
        (subscribe, None::<Subscription<V>>),
        |(subscribe, mut current)| async move {
            loop {
                if current.is_none() {
                    current = Some(subscribe()?);
                }
                let subscription = current.as_mut()?;
                if let Some(item) = subscription.next().await {
                    return Some((item, (subscribe, current)));
                }
                current = None;
            }
        },
    )
}

/// Pass items through until and including the first error
///
/// The source is not polled again once an error was yielded.
fn until_error<V, E>(
    stream: BoxStream<'static, Result<V, E>>,
) -> impl Stream<Item = Result<V, E>> + Send
where
    V: Send + 'static,
    E: Send + 'static,
{
    stream::unfold((stream, false), |(mut stream, failed)| async move {
        if failed {
            return None;
        }
        let item = stream.next().await?;
        let failed = item.is_err();
        Some((item, (stream, failed)))
    })
}

/// Versioned, cached, reactive accessor for one key
///
/// Cloning is cheap and clones share caches, executor and migration state.
pub struct Cell<K, T, S> {
    inner: Arc<CellInner<K, T, S>>,
}

impl<K, T, S> Cell<K, T, S>
where
    K: CellKey,
    T: ObjectValue,
    S: StoredValue,
{
    pub(crate) fn from_parts(parts: CellParts<K, T, S>) -> Self {
        let CellParts {
            key,
            store,
            converter,
            default,
            migration,
            migration_failure,
            validator,
            strategy,
            grace_period,
            executor,
            runtime,
        } = parts;
        let (writes, _) = broadcast::channel(WRITE_CHANNEL_CAPACITY);

        let inner = Arc::new_cyclic(|weak: &Weak<CellInner<K, T, S>>| {
            let layer = match strategy {
                ObserveStrategy::NoCache => ReadLayer::Direct,
                ObserveStrategy::CacheStoreValue => {
                    let weak = weak.clone();
                    let cache = DelayedRefCountCache::new(grace_period, move |publisher: Publisher<StoredItem<S>>| {
                        match weak.upgrade() {
                            Some(inner) => inner.connect(publisher, CellInner::read_stored),
                            None => Connection::none(),
                        }
                    });
                    ReadLayer::Stored(with_timer_runtime(cache, runtime))
                }
                ObserveStrategy::CacheActualValue => {
                    let weak = weak.clone();
                    let cache = DelayedRefCountCache::new(grace_period, move |publisher: Publisher<ObjectItem<T>>| {
                        match weak.upgrade() {
                            Some(inner) => inner.connect(publisher, CellInner::read_object),
                            None => Connection::none(),
                        }
                    });
                    ReadLayer::Actual(with_timer_runtime(cache, runtime))
                }
            };

            CellInner {
                key,
                store,
                converter,
                default,
                migration,
                migration_failure,
                migration_state: Mutex::new(MigrationState::Pending),
                validator,
                strategy,
                executor,
                writes,
                write_epoch: AtomicU64::new(0),
                layer,
            }
        });

        Self { inner }
    }

    /// Key of the entry
    #[inline]
    #[must_use]
    pub fn key(&self) -> &K {
        &self.inner.key
    }

    /// Observation strategy in effect
    #[inline]
    #[must_use]
    pub fn strategy(&self) -> ObserveStrategy {
        self.inner.strategy
    }

    /// Value read in place of absence, if configured
    #[inline]
    #[must_use]
    pub fn default_value(&self) -> Option<&T> {
        self.inner.default.as_ref()
    }

    /// Statistics of the shared cache, `None` for [`ObserveStrategy::NoCache`]
    #[must_use]
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.inner.layer.stats()
    }

    /// Observe the value
    ///
    /// The first item is the current value, read after migration on first
    /// poll. Every completed write emits again. The stream never completes
    /// on its own; it ends right after yielding an error.
    #[must_use]
    pub fn observe(&self) -> BoxStream<'static, ObjectItem<T>> {
        let inner = self.inner.clone();

        let values: BoxStream<'static, ObjectItem<T>> = match inner.strategy {
            ObserveStrategy::NoCache => {
                // Subscribe before the initial load so no write is missed
                let receiver = inner.writes.subscribe();
                let initial = stream::once(inner.clone().load_object());
                let updates = stream::unfold((inner.clone(), receiver), |(inner, mut receiver)| async move {
                    match receiver.recv().await {
                        Ok(()) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::debug!(key = ?inner.key, skipped, "observer lagged, reloading");
                        }
                        Err(RecvError::Closed) => return None,
                    }
                    let item = inner.clone().load_object().await;
                    Some((item, (inner, receiver)))
                });
                initial.chain(updates).boxed()
            }
            ObserveStrategy::CacheStoreValue => {
                let source = inner.clone();
                let converter = inner.clone();
                resubscribing(move || source.layer.subscribe_stored())
                    .then(move |item| converter.clone().convert_stored(item))
                    .boxed()
            }
            ObserveStrategy::CacheActualValue => {
                let source = inner.clone();
                resubscribing(move || source.layer.subscribe_actual()).boxed()
            }
        };

        until_error(values.map(move |item| item.map(|value| inner.resolve(value))).boxed()).boxed()
    }

    /// Current value
    ///
    /// # Errors
    /// Returns `CellError` if migration, the backend read or conversion
    /// fails.
    pub async fn get(&self) -> ObjectItem<T> {
        match self.observe().next().await {
            Some(item) => item,
            None => Err(CellError::StreamEnded {
                key: format!("{:?}", self.inner.key),
            }),
        }
    }

    /// Write `value` unless it equals the current value
    ///
    /// Absence and the default compare equal when a default is configured.
    ///
    /// # Errors
    /// Returns `CellError` if validation, the comparison read, conversion or
    /// the backend write fails.
    pub async fn set(&self, value: Option<T>) -> CellResult<()> {
        self.write(value, true).await
    }

    /// Write `value` without comparing to the current value
    ///
    /// # Errors
    /// Returns `CellError` if validation, conversion or the backend write
    /// fails.
    pub async fn force_set(&self, value: Option<T>) -> CellResult<()> {
        self.write(value, false).await
    }

    async fn write(&self, value: Option<T>, compare: bool) -> CellResult<()> {
        let inner = &self.inner;
        if let Some(validator) = &inner.validator {
            validator.validate(value.as_ref())?;
        }

        if compare {
            let current = self.get().await?;
            let candidate = inner.resolve(value.clone());
            if deep_equals(candidate.as_ref(), current.as_ref()) {
                tracing::trace!(key = ?inner.key, "value unchanged, skipping write");
                return Ok(());
            }
        }

        inner.layer.invalidate();
        let job_inner = inner.clone();
        let result = flatten(submit(inner.executor.as_ref(), move || job_inner.write_through(value)).await);

        if let Err(error) = &result {
            tracing::debug!(key = ?inner.key, error = %error, "write failed, retiring cache generation");
            inner.layer.retire();
        }
        result
    }

    /// Blocking [`Cell::get`]
    ///
    /// Must not be called from a job running on this cell's executor.
    ///
    /// # Errors
    /// Same as [`Cell::get`].
    pub fn get_sync(&self) -> ObjectItem<T> {
        futures::executor::block_on(self.get())
    }

    /// Blocking [`Cell::set`]
    ///
    /// # Errors
    /// Same as [`Cell::set`].
    pub fn set_sync(&self, value: Option<T>) -> CellResult<()> {
        futures::executor::block_on(self.set(value))
    }

    /// Blocking [`Cell::force_set`]
    ///
    /// # Errors
    /// Same as [`Cell::force_set`].
    pub fn force_set_sync(&self, value: Option<T>) -> CellResult<()> {
        futures::executor::block_on(self.force_set(value))
    }
}

impl<K, T, S> Clone for Cell<K, T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, T, S> Debug for Cell<K, T, S>
where
    K: Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("key", &self.inner.key)
            .field("strategy", &self.inner.strategy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ImmediateExecutor;
    use crate::ValidationError;
    use storable_store::{IdentityConverter, JsonConverter, MemoryStore, StoreError};

    fn parts<T: ObjectValue>(
        store: Arc<MemoryStore<String, T>>,
        strategy: ObserveStrategy,
    ) -> CellParts<String, T, T> {
        CellParts {
            key: "k".to_string(),
            store,
            converter: Arc::new(IdentityConverter::new()),
            default: None,
            migration: None,
            migration_failure: MigrationFailurePolicy::Propagate,
            validator: None,
            strategy,
            grace_period: Duration::ZERO,
            executor: Arc::new(ImmediateExecutor::new()),
            runtime: None,
        }
    }

    #[test]
    fn until_error_stops_after_first_error() {
        let items: Vec<Result<u8, &str>> = vec![Ok(1), Err("x"), Ok(2)];
        let seen: Vec<_> =
            futures::executor::block_on(until_error(stream::iter(items).boxed()).collect());
        assert_eq!(seen, vec![Ok(1), Err("x")]);
    }

    #[test]
    fn get_resolves_default() {
        let store = Arc::new(MemoryStore::new());
        let mut config = parts(store, ObserveStrategy::NoCache);
        config.default = Some(9u32);
        let cell = Cell::from_parts(config);

        assert_eq!(cell.get_sync().unwrap(), Some(9));
        assert_eq!(cell.default_value(), Some(&9));
        assert!(cell.cache_stats().is_none());
    }

    #[test]
    fn every_strategy_reads_writes() {
        for strategy in [
            ObserveStrategy::NoCache,
            ObserveStrategy::CacheStoreValue,
            ObserveStrategy::CacheActualValue,
        ] {
            let store = Arc::new(MemoryStore::new());
            let cell = Cell::from_parts(parts(store.clone(), strategy));

            assert_eq!(cell.get_sync().unwrap(), None, "{strategy:?}");
            cell.set_sync(Some("hello".to_string())).unwrap();
            assert_eq!(store.peek(&"k".to_string()).as_deref(), Some("hello"));
            assert_eq!(cell.get_sync().unwrap().as_deref(), Some("hello"), "{strategy:?}");

            cell.set_sync(None).unwrap();
            assert!(store.is_empty());
        }
    }

    #[test]
    fn validator_rejects_before_write() {
        let store = Arc::new(MemoryStore::new());
        let mut config = parts(store.clone(), ObserveStrategy::CacheActualValue);
        config.validator = Some(Arc::new(|value: Option<&i32>| match value {
            Some(v) if *v < 0 => Err(ValidationError::new("negative")),
            _ => Ok(()),
        }));
        let cell = Cell::from_parts(config);

        let err = cell.set_sync(Some(-5)).unwrap_err();
        assert!(err.is_validation());
        assert!(store.is_empty());
    }

    #[test]
    fn conversion_failure_surfaces_on_read() {
        let store = Arc::new(MemoryStore::<String, String>::new());
        store.insert("k".to_string(), "not json".to_string());
        let cell = Cell::from_parts(CellParts {
            key: "k".to_string(),
            store: store.clone(),
            converter: Arc::new(JsonConverter::<Vec<u8>>::new()),
            default: None,
            migration: None,
            migration_failure: MigrationFailurePolicy::Propagate,
            validator: None,
            strategy: ObserveStrategy::CacheStoreValue,
            grace_period: Duration::ZERO,
            executor: Arc::new(ImmediateExecutor::new()),
            runtime: None,
        });

        assert!(cell.get_sync().unwrap_err().is_conversion());
    }

    struct Unreachable;

    impl Store<String, u8> for Unreachable {
        fn contains(&self, _key: &String) -> bool {
            false
        }

        fn load(&self, _key: &String) -> Result<Option<u8>, StoreError> {
            Err(StoreError::Unavailable("offline".to_string()))
        }

        fn store(&self, _key: &String, _value: Option<&u8>) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("offline".to_string()))
        }
    }

    #[test]
    fn observe_ends_after_error() {
        let cell = Cell::from_parts(CellParts {
            key: "k".to_string(),
            store: Arc::new(Unreachable),
            converter: Arc::new(IdentityConverter::new()),
            default: None,
            migration: None,
            migration_failure: MigrationFailurePolicy::Propagate,
            validator: None,
            strategy: ObserveStrategy::CacheActualValue,
            grace_period: Duration::ZERO,
            executor: Arc::new(ImmediateExecutor::new()),
            runtime: None,
        });

        let items: Vec<_> = futures::executor::block_on(cell.observe().collect());
        assert_eq!(items.len(), 1);
        assert!(items[0].as_ref().unwrap_err().is_store());

        // Failed generation is gone; the next read starts over
        assert_eq!(cell.cache_stats().unwrap().generation, None);
        assert!(cell.force_set_sync(Some(1)).unwrap_err().is_store());
    }
}
