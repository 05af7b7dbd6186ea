//! Error types for cells
//!
//! Provides error handling for:
//! - Backend and conversion failures on read and write
//! - Migration failures surfaced by the first read
//! - Validation of candidate values
//! - Executor shutdown and job panics
//! - Construction-time misuse of [`crate::CellConfig`]

use storable_migration::MigrationError;
use storable_store::{ConversionError, StoreError};

/// A candidate value was rejected before writing
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("validation failed: {0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    /// Create validation error
    #[inline]
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Failures of the executor a job was submitted to
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    /// The executor no longer accepts jobs
    #[error("executor is shut down")]
    Shutdown,

    /// The job was dropped without producing a result
    #[error("job dropped before completion")]
    Dropped,

    /// No tokio runtime to run blocking jobs on
    #[error("no tokio runtime available")]
    NoRuntime,
}

/// Errors surfaced by cell operations
///
/// `Clone` so one failure can be delivered to every coalesced observer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CellError {
    /// Backend failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Conversion between object and stored form failed
    #[error("conversion error: {0}")]
    Conversion(#[from] ConversionError),

    /// Migration before the first read failed
    #[error("migration error: {0}")]
    Migration(#[from] MigrationError),

    /// Candidate rejected by the validator
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Job could not run
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    /// Observation ended before a value arrived
    #[error("observation of {key} ended without a value")]
    StreamEnded { key: String },
}

impl CellError {
    /// Check if error came from the backend
    #[inline]
    #[must_use]
    pub fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }

    /// Check if error came from a converter
    #[inline]
    #[must_use]
    pub fn is_conversion(&self) -> bool {
        matches!(self, Self::Conversion(_))
    }

    /// Check if error came from the migration engine
    #[inline]
    #[must_use]
    pub fn is_migration(&self) -> bool {
        matches!(self, Self::Migration(_))
    }

    /// Check if a candidate value was rejected
    #[inline]
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

/// Result type alias for cell operations
pub type CellResult<T> = Result<T, CellError>;

/// Construction-time misuse of a cell configuration
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Converter rejected the default value
    #[error("default value for {key} cannot be converted: {source}")]
    DefaultNotConvertible {
        key: String,
        #[source]
        source: ConversionError,
    },

    /// A safe non-null cell needs a default to fall back on
    #[error("safe non-null cell for {key} requires a default value")]
    MissingDefault { key: String },

    /// Default worker thread could not be spawned
    #[error("failed to start executor: {0}")]
    Executor(#[from] std::io::Error),
}

/// Settings could not be parsed
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// TOML syntax or schema error
    #[error("invalid settings: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifiers() {
        let store = CellError::from(StoreError::Unavailable("db".to_string()));
        assert!(store.is_store());
        assert!(!store.is_migration());

        let validation = CellError::from(ValidationError::new("negative"));
        assert!(validation.is_validation());
        assert_eq!(validation.to_string(), "validation failed: negative");
    }

    #[test]
    fn migration_errors_wrap() {
        let err = CellError::from(MigrationError::InvalidLatest(-3));
        assert!(err.is_migration());
        assert_eq!(err.to_string(), "migration error: invalid latest version: -3");
    }

    #[test]
    fn build_error_display() {
        let err = BuildError::MissingDefault {
            key: "\"theme\"".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "safe non-null cell for \"theme\" requires a default value"
        );
    }
}
