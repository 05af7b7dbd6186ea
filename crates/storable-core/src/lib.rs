//! Storable Core - versioned, cached, reactive key-value cells
//!
//! A [`Cell`] sits between one persisted entry and application code:
//! - Converts between the object value and its stored representation
//! - Migrates the entry through its schema versions before the first read
//! - Coalesces concurrent reads and caches them for a grace period
//! - Republishes every completed write to all observers
//!
//! # Example
//!
//! ```rust
//! use futures::StreamExt;
//! use storable_core::CellConfig;
//! use storable_store::{IdentityConverter, MemoryStore};
//!
//! # futures::executor::block_on(async {
//! let cell = CellConfig::new("retries".to_string(), MemoryStore::new(), IdentityConverter::new())
//!     .with_default(0u32)
//!     .build()
//!     .unwrap();
//!
//! let mut updates = cell.observe();
//! assert_eq!(updates.next().await.unwrap().unwrap(), Some(0));
//!
//! cell.set(Some(5)).await.unwrap();
//! assert_eq!(updates.next().await.unwrap().unwrap(), Some(5));
//! # });
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

// Core modules
mod cell;
mod config;
mod error;
mod executor;
mod settings;
mod strategy;
mod validator;
mod wrappers;

// Re-exports
pub use cell::{Cell, CellKey, ObjectValue, StoredValue};
pub use config::CellConfig;
pub use error::{BuildError, CellError, CellResult, ExecutorError, SettingsError, ValidationError};
pub use executor::{BlockingExecutor, Executor, ImmediateExecutor, Job, SequentialExecutor};
pub use settings::{CellSettings, MigrationFailurePolicy, DEFAULT_GRACE_PERIOD_MS};
pub use strategy::{is_simple_type, ObserveStrategy};
pub use validator::Validator;
pub use wrappers::{NonNullCell, SafeCell, SafeNonNullCell};

pub use storable_cache::CacheStats;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with cells
    pub use crate::{
        Cell, CellConfig, CellError, CellResult, CellSettings, NonNullCell, ObserveStrategy,
        SafeCell, SafeNonNullCell,
    };
    pub use storable_migration::{Migration, Migrator, MissingPathPolicy, StoreMigrator};
    pub use storable_store::{Converter, IdentityConverter, JsonConverter, MemoryStore, Store};
}
