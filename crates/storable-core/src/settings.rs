//! Cell settings loadable from TOML

use crate::error::SettingsError;
use crate::strategy::ObserveStrategy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default grace period of a cache generation in milliseconds
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 1000;

/// What a read does when migration fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationFailurePolicy {
    /// Surface the failure to the reader
    #[default]
    Propagate,
    /// Log it and read at the recorded version
    LogAndContinue,
}

/// Tunables of a cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CellSettings {
    /// Observation strategy; derived from the value types when unset
    pub strategy: Option<ObserveStrategy>,
    /// How long a cache generation outlives its last observer
    pub grace_period_ms: u64,
    /// Reaction to migration failures during reads
    pub migration_failure: MigrationFailurePolicy,
}

impl CellSettings {
    /// Create settings with defaults
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse settings from TOML; missing fields take their defaults
    ///
    /// # Errors
    /// Returns `SettingsError::Parse` on malformed input.
    pub fn from_toml_str(input: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(input)?)
    }

    /// Set strategy
    #[inline]
    #[must_use]
    pub fn with_strategy(mut self, strategy: ObserveStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Set grace period
    #[inline]
    #[must_use]
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set migration failure policy
    #[inline]
    #[must_use]
    pub fn with_migration_failure(mut self, policy: MigrationFailurePolicy) -> Self {
        self.migration_failure = policy;
        self
    }

    /// Grace period as a duration
    #[inline]
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl Default for CellSettings {
    fn default() -> Self {
        Self {
            strategy: None,
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            migration_failure: MigrationFailurePolicy::Propagate,
        }
    }
}
