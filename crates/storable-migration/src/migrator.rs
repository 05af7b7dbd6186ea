//! Single version-transition rules
//!
//! Provides the [`Migrator`] trait and [`StoreMigrator`], the stock rule that
//! moves an entry from one store representation to another.

use crate::error::MigrationError;
use crate::version::Version;
use std::fmt::Debug;
use std::ops::RangeInclusive;
use std::sync::Arc;
use storable_store::{ConversionError, Store};

/// One version transition
///
/// Migrators are immutable and stateless across calls except through the
/// stores they reference.
pub trait Migrator<K>: Send + Sync {
    /// Whether this rule accepts entries recorded at `version`
    fn supports_version(&self, version: Version) -> bool;

    /// Whether `key` currently has data eligible for this transition
    ///
    /// # Errors
    /// Returns `MigrationError` if eligibility cannot be determined.
    fn can_migrate(&self, key: &K, version: Version) -> Result<bool, MigrationError>;

    /// Perform the transition, returning the new version
    ///
    /// # Errors
    /// Returns `MigrationError` if the entry cannot be moved.
    fn migrate(&self, key: &K, version: Version) -> Result<Version, MigrationError>;
}

#[cfg(test)]
mockall::mock! {
    pub Migrator<K: Send + Sync + 'static> {}

    impl<K: Send + Sync + 'static> Migrator<K> for Migrator<K> {
        fn supports_version(&self, version: Version) -> bool;
        fn can_migrate(&self, key: &K, version: Version) -> Result<bool, MigrationError>;
        fn migrate(&self, key: &K, version: Version) -> Result<Version, MigrationError>;
    }
}

impl<K, M> Migrator<K> for Arc<M>
where
    M: Migrator<K> + ?Sized,
{
    #[inline]
    fn supports_version(&self, version: Version) -> bool {
        (**self).supports_version(version)
    }

    #[inline]
    fn can_migrate(&self, key: &K, version: Version) -> Result<bool, MigrationError> {
        (**self).can_migrate(key, version)
    }

    #[inline]
    fn migrate(&self, key: &K, version: Version) -> Result<Version, MigrationError> {
        (**self).migrate(key, version)
    }
}

type Transform<A, B> = Box<dyn Fn(A) -> Result<Option<B>, ConversionError> + Send + Sync>;

/// Moves an entry from an old store representation to a new one
///
/// `old` and `new` may be the same backend seen through different value
/// types. The entry is eligible while the old store contains the key.
pub struct StoreMigrator<K, A, B> {
    old: Arc<dyn Store<K, A>>,
    new: Arc<dyn Store<K, B>>,
    accepts: RangeInclusive<Version>,
    target: Version,
    transform: Transform<A, B>,
    remove_old: bool,
}

impl<K, A, B> StoreMigrator<K, A, B>
where
    K: Debug,
{
    /// Create migrator
    ///
    /// # Arguments
    /// * `old` - Store holding the entry at the accepted versions
    /// * `new` - Store receiving the transformed entry
    /// * `accepts` - Versions this rule migrates from
    /// * `target` - Version recorded once the rule ran
    /// * `transform` - Old value to new value; `None` writes an absent entry
    pub fn new<F>(
        old: impl Store<K, A> + 'static,
        new: impl Store<K, B> + 'static,
        accepts: RangeInclusive<Version>,
        target: Version,
        transform: F,
    ) -> Self
    where
        F: Fn(A) -> Result<Option<B>, ConversionError> + Send + Sync + 'static,
    {
        Self {
            old: Arc::new(old),
            new: Arc::new(new),
            accepts,
            target,
            transform: Box::new(transform),
            remove_old: false,
        }
    }

    /// Remove the old entry after a successful transition
    ///
    /// Only meaningful when the old and new stores are distinct backends.
    #[inline]
    #[must_use]
    pub fn removing_old(mut self) -> Self {
        self.remove_old = true;
        self
    }

    /// Version produced by this rule
    #[inline]
    #[must_use]
    pub fn target(&self) -> Version {
        self.target
    }
}

impl<K, A, B> Debug for StoreMigrator<K, A, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreMigrator")
            .field("accepts", &self.accepts)
            .field("target", &self.target)
            .field("remove_old", &self.remove_old)
            .finish_non_exhaustive()
    }
}

impl<K, A, B> Migrator<K> for StoreMigrator<K, A, B>
where
    K: Debug + Send + Sync,
    A: Send + Sync,
    B: Send + Sync,
{
    fn supports_version(&self, version: Version) -> bool {
        self.accepts.contains(&version)
    }

    fn can_migrate(&self, key: &K, version: Version) -> Result<bool, MigrationError> {
        Ok(self.supports_version(version) && self.old.contains(key))
    }

    fn migrate(&self, key: &K, version: Version) -> Result<Version, MigrationError> {
        let migrated = match self.old.load(key)? {
            Some(value) => (self.transform)(value)?,
            None => None,
        };
        self.new.store(key, migrated.as_ref())?;

        if self.remove_old {
            self.old.store(key, None)?;
        }

        tracing::debug!(key = ?key, from = version, to = self.target, "entry migrated");
        Ok(self.target)
    }
}
