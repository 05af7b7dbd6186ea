//! Error types for the migration engine
//!
//! Provides error handling for:
//! - Programmer errors in migrator chains (downgrade, stuck round, overshoot)
//! - Configuration gaps (no migration path)
//! - Backend and conversion failures while migrating

use crate::version::Version;
use storable_store::{ConversionError, StoreError};

/// Errors during migration of a key
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MigrationError {
    /// A migrator returned a version below the one recorded for the round
    #[error("migration of {key} downgraded from version {from} to {to}")]
    Downgraded { key: String, from: Version, to: Version },

    /// A migrator ran but left the version unchanged
    #[error("migrator #{migrator} ran for {key} without leaving version {version}")]
    Stuck {
        key: String,
        version: Version,
        migrator: usize,
    },

    /// A version above the configured latest was produced or recorded
    #[error("version {version} of {key} exceeds latest version {latest}")]
    ExceedsLatest {
        key: String,
        version: Version,
        latest: Version,
    },

    /// No migrator applies and the missing path policy forbids stopping
    #[error("no migrator applies to {key} at version {version} (latest {latest})")]
    NoPath {
        key: String,
        version: Version,
        latest: Version,
    },

    /// Latest version is below the never-migrated marker
    #[error("invalid latest version: {0}")]
    InvalidLatest(Version),

    /// Backend failure while migrating
    #[error("store error while migrating: {0}")]
    Store(#[from] StoreError),

    /// Transform failure while migrating
    #[error("conversion error while migrating: {0}")]
    Conversion(#[from] ConversionError),

    /// Migrator-specific failure
    #[error("migrator failed: {0}")]
    Failed(String),
}

impl MigrationError {
    /// Check if error indicates a defect in the migrator chain
    ///
    /// These are never transient: retrying the same chain fails the same way.
    #[inline]
    #[must_use]
    pub fn is_chain_defect(&self) -> bool {
        matches!(
            self,
            Self::Downgraded { .. }
                | Self::Stuck { .. }
                | Self::ExceedsLatest { .. }
                | Self::InvalidLatest(_)
        )
    }
}

/// Result type alias for migration operations
pub type MigrationResult<T> = Result<T, MigrationError>;
