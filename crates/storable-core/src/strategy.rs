//! How observations share backend reads

use serde::{Deserialize, Serialize};
use std::any::TypeId;
use std::time::Duration;

/// Caching layer used by a cell's observations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObserveStrategy {
    /// Every emission re-reads the backend and reconverts
    NoCache,
    /// Share the stored representation, reconvert per emission
    CacheStoreValue,
    /// Share the converted object
    CacheActualValue,
}

impl ObserveStrategy {
    /// Strategy used when none is configured
    ///
    /// Immutable simple object values are shared directly; otherwise a simple
    /// stored value is shared and reconverted; otherwise nothing is shared.
    #[must_use]
    pub fn default_for<T: 'static, S: 'static>() -> Self {
        if is_simple_type::<T>() {
            Self::CacheActualValue
        } else if is_simple_type::<S>() {
            Self::CacheStoreValue
        } else {
            Self::NoCache
        }
    }

    /// Check if observations share a cache
    #[inline]
    #[must_use]
    pub fn is_cached(self) -> bool {
        !matches!(self, Self::NoCache)
    }
}

/// Check if `T` is a recognised simple immutable type
#[must_use]
pub fn is_simple_type<T: 'static>() -> bool {
    let id = TypeId::of::<T>();
    [
        TypeId::of::<bool>(),
        TypeId::of::<char>(),
        TypeId::of::<i8>(),
        TypeId::of::<i16>(),
        TypeId::of::<i32>(),
        TypeId::of::<i64>(),
        TypeId::of::<i128>(),
        TypeId::of::<isize>(),
        TypeId::of::<u8>(),
        TypeId::of::<u16>(),
        TypeId::of::<u32>(),
        TypeId::of::<u64>(),
        TypeId::of::<u128>(),
        TypeId::of::<usize>(),
        TypeId::of::<f32>(),
        TypeId::of::<f64>(),
        TypeId::of::<String>(),
        TypeId::of::<&'static str>(),
        TypeId::of::<Duration>(),
        TypeId::of::<()>(),
    ]
    .contains(&id)
}
