//! Storable Store Contracts
//!
//! The collaborators a cell is built from.
//!
//! # Core Concepts
//!
//! - [`Store<K, V>`]: key-value backend with existence check, load and store
//! - [`Converter<A, B>`]: bidirectional transform between object and stored form
//! - [`SafeStore`] / [`SafeConverter`]: decorators that never fail
//! - [`deep_equals`]: content equality used to skip redundant writes
//!
//! # Example
//!
//! ```rust
//! use storable_store::{Converter, JsonConverter, MemoryStore, Store};
//!
//! let store = MemoryStore::<String, String>::new();
//! let converter = JsonConverter::<Vec<u32>>::new();
//!
//! let key = "recent".to_string();
//! let stored = converter.to_stored(Some(&vec![1, 2, 3])).unwrap();
//! store.store(&key, stored.as_ref()).unwrap();
//!
//! let loaded = store.load(&key).unwrap();
//! assert_eq!(converter.to_object(loaded.as_ref()).unwrap(), Some(vec![1, 2, 3]));
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

// Core modules
mod converter;
mod equality;
mod error;
mod store;

// Re-exports
pub use converter::{Converter, FnConverter, IdentityConverter, JsonConverter, SafeConverter};
pub use equality::deep_equals;
pub use error::{ConversionError, StoreError, StoreResult};
pub use store::{MemoryStore, SafeStore, Store};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
