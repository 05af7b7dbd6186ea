//! Error types for backend and conversion collaborators
//!
//! Both error types are `Clone` so that one failed load can be delivered to
//! every observer sharing it.

use std::fmt::Debug;

/// Errors raised by a [`Store`](crate::Store) backend
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Reading an entry failed
    #[error("failed to load {key}: {message}")]
    Load { key: String, message: String },

    /// Writing or removing an entry failed
    #[error("failed to store {key}: {message}")]
    Write { key: String, message: String },

    /// Backend is not reachable at all
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Create load error for key
    pub fn load(key: &impl Debug, message: impl Into<String>) -> Self {
        Self::Load {
            key: format!("{key:?}"),
            message: message.into(),
        }
    }

    /// Create write error for key
    pub fn write(key: &impl Debug, message: impl Into<String>) -> Self {
        Self::Write {
            key: format!("{key:?}"),
            message: message.into(),
        }
    }
}

/// Errors raised by a [`Converter`](crate::Converter)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversionError {
    /// Object value could not be turned into its stored form
    #[error("cannot convert to stored form: {0}")]
    ToStored(String),

    /// Stored value could not be turned into its object form
    #[error("cannot convert to object form: {0}")]
    ToObject(String),
}

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;
