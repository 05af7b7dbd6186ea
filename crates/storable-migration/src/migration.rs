//! Per-key migration state machine
//!
//! A key is either `unmigrated(v)` with `v < latest` or `current`. Each round
//! loads the recorded version and walks the migrator list in declaration
//! order; every accepted step is written to the version store before the next
//! migrator is consulted.

use crate::error::{MigrationError, MigrationResult};
use crate::migrator::Migrator;
use crate::version::{Version, DEFAULT_VERSION};
use std::fmt::Debug;
use std::sync::Arc;
use storable_store::Store;

/// What to do when no migrator applies below the latest version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingPathPolicy {
    /// Stop without error and leave the recorded version
    #[default]
    Stop,
    /// Fail with [`MigrationError::NoPath`]
    Fail,
    /// Treat the entry as fresh and record the latest version
    AdoptLatest,
}

/// Final state of a migration run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    /// Recorded version equals latest
    Current,
    /// Stopped below latest under [`MissingPathPolicy::Stop`]
    Stalled,
}

/// Summary of one `migrate_to_latest_version` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationOutcome {
    /// Version recorded before the run
    pub from: Version,
    /// Version recorded after the run
    pub to: Version,
    /// Number of migrators that ran
    pub steps: usize,
    /// Number of rounds that ran at least one migrator
    pub rounds: usize,
    /// Final state
    pub status: MigrationStatus,
}

impl MigrationOutcome {
    /// Check if the key reached the latest version
    #[inline]
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.status == MigrationStatus::Current
    }
}

/// Ordered migrator chain bound to a version marker store
pub struct Migration<K> {
    version_store: Arc<dyn Store<K, Version>>,
    migrators: Vec<Arc<dyn Migrator<K>>>,
    latest: Version,
    missing_path: MissingPathPolicy,
}

impl<K> Migration<K>
where
    K: Debug,
{
    /// Create migration engine
    ///
    /// # Arguments
    /// * `version_store` - Persisted key to version relation
    /// * `latest` - Version every key is migrated to
    ///
    /// # Errors
    /// Returns `MigrationError::InvalidLatest` if `latest` is below
    /// [`DEFAULT_VERSION`].
    pub fn new(
        version_store: impl Store<K, Version> + 'static,
        latest: Version,
    ) -> MigrationResult<Self> {
        if latest < DEFAULT_VERSION {
            return Err(MigrationError::InvalidLatest(latest));
        }
        Ok(Self {
            version_store: Arc::new(version_store),
            migrators: Vec::new(),
            latest,
            missing_path: MissingPathPolicy::default(),
        })
    }

    /// Append a migrator; declaration order is iteration order
    #[must_use]
    pub fn with_migrator(mut self, migrator: impl Migrator<K> + 'static) -> Self {
        self.migrators.push(Arc::new(migrator));
        self
    }

    /// Set the missing path policy
    #[inline]
    #[must_use]
    pub fn with_missing_path_policy(mut self, policy: MissingPathPolicy) -> Self {
        self.missing_path = policy;
        self
    }

    /// Latest version
    #[inline]
    #[must_use]
    pub fn latest_version(&self) -> Version {
        self.latest
    }

    /// Number of migrators in the chain
    #[inline]
    #[must_use]
    pub fn migrator_count(&self) -> usize {
        self.migrators.len()
    }

    /// Missing path policy in effect
    #[inline]
    #[must_use]
    pub fn missing_path_policy(&self) -> MissingPathPolicy {
        self.missing_path
    }

    /// Version recorded for `key`, [`DEFAULT_VERSION`] when absent
    ///
    /// # Errors
    /// Returns `MigrationError::Store` if the version store cannot be read.
    pub fn recorded_version(&self, key: &K) -> MigrationResult<Version> {
        Ok(self.version_store.load(key)?.unwrap_or(DEFAULT_VERSION))
    }

    fn record(&self, key: &K, version: Version) -> MigrationResult<()> {
        self.version_store.store(key, Some(&version))?;
        Ok(())
    }

    /// Record `key` as current without running any migrator
    ///
    /// Used once data in the latest format has been written for `key`.
    ///
    /// # Errors
    /// Returns `MigrationError::Store` if the version store cannot be written.
    pub fn record_latest_version(&self, key: &K) -> MigrationResult<()> {
        tracing::debug!(key = ?key, latest = self.latest, "recording latest version");
        self.record(key, self.latest)
    }

    /// Migrate `key` until it is current or no migrator applies
    ///
    /// # Errors
    /// Returns `MigrationError` on a downgrade, a stuck migrator, a version
    /// above latest, a missing path under [`MissingPathPolicy::Fail`], or any
    /// failure raised by a migrator or the version store. Steps accepted
    /// before the failure stay recorded.
    pub fn migrate_to_latest_version(&self, key: &K) -> MigrationResult<MigrationOutcome> {
        let marker = self.version_store.load(key)?;
        let from = marker.unwrap_or(DEFAULT_VERSION);
        if marker.is_none() && from == self.latest {
            self.record(key, from)?;
        }
        let mut outcome = MigrationOutcome {
            from,
            to: from,
            steps: 0,
            rounds: 0,
            status: MigrationStatus::Current,
        };

        loop {
            let round_start = self.recorded_version(key)?;
            outcome.to = round_start;

            if round_start > self.latest {
                return Err(MigrationError::ExceedsLatest {
                    key: format!("{key:?}"),
                    version: round_start,
                    latest: self.latest,
                });
            }
            if round_start == self.latest {
                return Ok(outcome);
            }

            let steps = self.run_round(key, round_start)?;
            if steps > 0 {
                outcome.steps += steps;
                outcome.rounds += 1;
                continue;
            }

            return match self.missing_path {
                MissingPathPolicy::Stop => {
                    tracing::debug!(
                        key = ?key,
                        version = round_start,
                        latest = self.latest,
                        "no migrator applies, leaving version"
                    );
                    outcome.status = MigrationStatus::Stalled;
                    Ok(outcome)
                }
                MissingPathPolicy::Fail => Err(MigrationError::NoPath {
                    key: format!("{key:?}"),
                    version: round_start,
                    latest: self.latest,
                }),
                MissingPathPolicy::AdoptLatest => {
                    tracing::debug!(key = ?key, latest = self.latest, "adopting latest version");
                    self.record(key, self.latest)?;
                    outcome.to = self.latest;
                    Ok(outcome)
                }
            };
        }
    }

    /// Run every applicable migrator once, returning how many ran
    ///
    /// A candidate below the version it was produced from is a downgrade, so
    /// the recorded version never decreases within a run.
    fn run_round(&self, key: &K, start: Version) -> MigrationResult<usize> {
        let mut version = start;
        let mut steps = 0;

        for (index, migrator) in self.migrators.iter().enumerate() {
            if version == self.latest {
                break;
            }
            if !migrator.supports_version(version) || !migrator.can_migrate(key, version)? {
                continue;
            }

            let candidate = migrator.migrate(key, version)?;
            if candidate < version {
                return Err(MigrationError::Downgraded {
                    key: format!("{key:?}"),
                    from: version,
                    to: candidate,
                });
            }
            if candidate > self.latest {
                return Err(MigrationError::ExceedsLatest {
                    key: format!("{key:?}"),
                    version: candidate,
                    latest: self.latest,
                });
            }
            if candidate == version {
                return Err(MigrationError::Stuck {
                    key: format!("{key:?}"),
                    version,
                    migrator: index,
                });
            }

            tracing::debug!(key = ?key, from = version, to = candidate, migrator = index, "migration step");
            self.record(key, candidate)?;
            version = candidate;
            steps += 1;
        }

        Ok(steps)
    }
}

impl<K> Debug for Migration<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("latest", &self.latest)
            .field("migrators", &self.migrators.len())
            .field("missing_path", &self.missing_path)
            .finish_non_exhaustive()
    }
}
