//! Storable Migration Engine
//!
//! Moves a persisted entry through an ordered chain of schema versions before
//! it is read at its current version.
//!
//! # Core Concepts
//!
//! - [`Migrator`]: one version transition, eligible per key and version
//! - [`StoreMigrator`]: stock transition between two store representations
//! - [`Migration`]: ordered chain plus the persisted key to version marker
//! - [`MissingPathPolicy`]: behaviour when no migrator applies below latest
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use storable_migration::{Migration, StoreMigrator};
//! use storable_store::{MemoryStore, Store};
//!
//! let legacy = Arc::new(MemoryStore::<String, String>::new());
//! let current = Arc::new(MemoryStore::<String, u32>::new());
//! legacy.insert("retries".to_string(), "3".to_string());
//!
//! let migration = Migration::new(MemoryStore::<String, i32>::new(), 0)
//!     .unwrap()
//!     .with_migrator(StoreMigrator::new(legacy, current.clone(), -1..=-1, 0, |text: String| {
//!         Ok(text.parse().ok())
//!     }));
//!
//! let outcome = migration.migrate_to_latest_version(&"retries".to_string()).unwrap();
//! assert!(outcome.is_current());
//! assert_eq!(current.load(&"retries".to_string()).unwrap(), Some(3));
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

// Core modules
mod error;
mod migration;
mod migrator;
mod version;

// Re-exports
pub use error::{MigrationError, MigrationResult};
pub use migration::{Migration, MigrationOutcome, MigrationStatus, MissingPathPolicy};
pub use migrator::{Migrator, StoreMigrator};
pub use version::{Version, DEFAULT_VERSION};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude for common imports
pub mod prelude {
    pub use crate::{
        Migration, MigrationError, MigrationOutcome, Migrator, MissingPathPolicy, StoreMigrator,
        Version,
    };
}
