//! Cell configuration and validating factory

use crate::cell::{Cell, CellKey, CellParts, ObjectValue, StoredValue};
use crate::error::BuildError;
use crate::executor::{Executor, SequentialExecutor};
use crate::settings::{CellSettings, MigrationFailurePolicy};
use crate::strategy::ObserveStrategy;
use crate::validator::Validator;
use crate::wrappers::{NonNullCell, SafeCell, SafeNonNullCell};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use storable_migration::Migration;
use tokio::runtime::Handle;
use storable_store::{Converter, Store};

/// Everything needed to build a cell for one key
///
/// # Example
///
/// ```rust
/// use storable_core::{CellConfig, ImmediateExecutor, ObserveStrategy};
/// use storable_store::{JsonConverter, MemoryStore};
///
/// let cell = CellConfig::new(
///     "volume".to_string(),
///     MemoryStore::<String, String>::new(),
///     JsonConverter::<u8>::new(),
/// )
/// .with_default(50)
/// .with_executor(ImmediateExecutor::new())
/// .build()
/// .unwrap();
///
/// assert_eq!(cell.strategy(), ObserveStrategy::CacheActualValue);
/// assert_eq!(cell.get_sync().unwrap(), Some(50));
/// ```
pub struct CellConfig<K, T, S> {
    key: K,
    store: Arc<dyn Store<K, S>>,
    converter: Arc<dyn Converter<T, S>>,
    default: Option<T>,
    migration: Option<Arc<Migration<K>>>,
    executor: Option<Arc<dyn Executor>>,
    validator: Option<Arc<dyn Validator<T>>>,
    runtime: Option<Handle>,
    settings: CellSettings,
}

impl<K, T, S> CellConfig<K, T, S>
where
    K: CellKey,
    T: ObjectValue,
    S: StoredValue,
{
    /// Create configuration
    ///
    /// # Arguments
    /// * `key` - Key of the entry
    /// * `store` - Backend holding the stored representation
    /// * `converter` - Object to stored form and back
    pub fn new(
        key: K,
        store: impl Store<K, S> + 'static,
        converter: impl Converter<T, S> + 'static,
    ) -> Self {
        Self {
            key,
            store: Arc::new(store),
            converter: Arc::new(converter),
            default: None,
            migration: None,
            executor: None,
            validator: None,
            runtime: None,
            settings: CellSettings::default(),
        }
    }

    /// Value read in place of absence
    #[must_use]
    pub fn with_default(mut self, default: T) -> Self {
        self.default = Some(default);
        self
    }

    /// Migrate the key before its first read
    #[must_use]
    pub fn with_migration(mut self, migration: impl Into<Arc<Migration<K>>>) -> Self {
        self.migration = Some(migration.into());
        self
    }

    /// Override the strategy derived from the value types
    #[inline]
    #[must_use]
    pub fn with_strategy(mut self, strategy: ObserveStrategy) -> Self {
        self.settings.strategy = Some(strategy);
        self
    }

    /// Run jobs on `executor` instead of a dedicated worker thread
    #[must_use]
    pub fn with_executor(mut self, executor: impl Executor + 'static) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }

    /// Check candidates before writing
    #[must_use]
    pub fn with_validator(mut self, validator: impl Validator<T> + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Run cache grace timers on `runtime`
    ///
    /// Needed only for cells used outside a tokio runtime; without one,
    /// caches are evicted as soon as their last observer leaves.
    #[must_use]
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Replace all settings
    #[inline]
    #[must_use]
    pub fn with_settings(mut self, settings: CellSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the cache grace period
    #[inline]
    #[must_use]
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.settings = self.settings.with_grace_period(grace);
        self
    }

    /// Set the reaction to migration failures during reads
    #[inline]
    #[must_use]
    pub fn with_migration_failure(mut self, policy: MigrationFailurePolicy) -> Self {
        self.settings = self.settings.with_migration_failure(policy);
        self
    }

    /// Settings in effect
    #[inline]
    #[must_use]
    pub fn settings(&self) -> &CellSettings {
        &self.settings
    }

    /// Strategy the built cell will use
    #[must_use]
    pub fn resolved_strategy(&self) -> ObserveStrategy {
        self.settings
            .strategy
            .unwrap_or_else(ObserveStrategy::default_for::<T, S>)
    }

    /// Build the cell
    ///
    /// # Errors
    /// Returns `BuildError::DefaultNotConvertible` if the converter rejects
    /// the default, or `BuildError::Executor` if the worker thread cannot be
    /// spawned.
    pub fn build(self) -> Result<Cell<K, T, S>, BuildError> {
        if let Some(default) = &self.default {
            self.converter.to_stored(Some(default)).map_err(|source| {
                BuildError::DefaultNotConvertible {
                    key: format!("{:?}", self.key),
                    source,
                }
            })?;
        }

        let strategy = self.resolved_strategy();
        let executor: Arc<dyn Executor> = match self.executor {
            Some(executor) => executor,
            None => Arc::new(SequentialExecutor::new(format!("storable:{:?}", self.key))?),
        };

        tracing::debug!(key = ?self.key, ?strategy, "cell built");
        Ok(Cell::from_parts(CellParts {
            key: self.key,
            store: self.store,
            converter: self.converter,
            default: self.default,
            migration: self.migration,
            migration_failure: self.settings.migration_failure,
            validator: self.validator,
            strategy,
            grace_period: self.settings.grace_period(),
            executor,
            runtime: self.runtime,
        }))
    }

    /// Build a cell that logs failures instead of returning them
    ///
    /// # Errors
    /// Same as [`CellConfig::build`].
    pub fn build_safe(self) -> Result<SafeCell<K, T, S>, BuildError> {
        self.build().map(SafeCell::new)
    }

    /// Build a cell whose values are never absent
    ///
    /// # Errors
    /// Same as [`CellConfig::build`].
    pub fn build_non_null(self) -> Result<NonNullCell<K, T, S>, BuildError> {
        self.build().map(NonNullCell::new)
    }

    /// Build a never-failing cell whose values are never absent
    ///
    /// # Errors
    /// Returns `BuildError::MissingDefault` without a default, otherwise the
    /// same as [`CellConfig::build`].
    pub fn build_safe_non_null(self) -> Result<SafeNonNullCell<K, T, S>, BuildError> {
        let Some(default) = self.default.clone() else {
            return Err(BuildError::MissingDefault {
                key: format!("{:?}", self.key),
            });
        };
        self.build()
            .map(|cell| SafeNonNullCell::new(SafeCell::new(cell), default))
    }
}

impl<K, T, S> fmt::Debug for CellConfig<K, T, S>
where
    K: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellConfig")
            .field("key", &self.key)
            .field("has_default", &self.default.is_some())
            .field("has_migration", &self.migration.is_some())
            .field("has_runtime", &self.runtime.is_some())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
