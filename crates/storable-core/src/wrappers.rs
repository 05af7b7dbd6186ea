//! Decorations over [`Cell`]
//!
//! - [`SafeCell`] logs failures and falls back to the default
//! - [`NonNullCell`] reads values that are never absent
//! - [`SafeNonNullCell`] combines both

use crate::cell::{Cell, CellKey, ObjectValue, StoredValue};
use crate::error::CellResult;
use futures::stream::{BoxStream, StreamExt};

/// Cell that never fails
///
/// Read failures are logged and replaced by the default (or absence without
/// one); write failures are logged and dropped.
#[derive(Debug, Clone)]
pub struct SafeCell<K, T, S> {
    cell: Cell<K, T, S>,
}

impl<K, T, S> SafeCell<K, T, S>
where
    K: CellKey,
    T: ObjectValue,
    S: StoredValue,
{
    /// Wrap a cell
    #[inline]
    #[must_use]
    pub fn new(cell: Cell<K, T, S>) -> Self {
        Self { cell }
    }

    /// Wrapped cell
    #[inline]
    #[must_use]
    pub fn inner(&self) -> &Cell<K, T, S> {
        &self.cell
    }

    fn fallback(&self, value: CellResult<Option<T>>) -> Option<T> {
        value.unwrap_or_else(|error| {
            tracing::warn!(key = ?self.cell.key(), error = %error, "read failed, using default");
            self.cell.default_value().cloned()
        })
    }

    fn swallow(&self, result: CellResult<()>) {
        if let Err(error) = result {
            tracing::warn!(key = ?self.cell.key(), error = %error, "write failed, dropped");
        }
    }

    /// Current value
    pub async fn get(&self) -> Option<T> {
        self.fallback(self.cell.get().await)
    }

    /// Observe the value
    ///
    /// A failure is emitted as the default and ends the stream.
    #[must_use]
    pub fn observe(&self) -> BoxStream<'static, Option<T>> {
        let key = self.cell.key().clone();
        let default = self.cell.default_value().cloned();
        self.cell
            .observe()
            .map(move |item| {
                item.unwrap_or_else(|error| {
                    tracing::warn!(key = ?key, error = %error, "observation failed, using default");
                    default.clone()
                })
            })
            .boxed()
    }

    /// Write `value` unless unchanged
    pub async fn set(&self, value: Option<T>) {
        self.swallow(self.cell.set(value).await);
    }

    /// Write `value` unconditionally
    pub async fn force_set(&self, value: Option<T>) {
        self.swallow(self.cell.force_set(value).await);
    }

    /// Blocking [`SafeCell::get`]
    #[must_use]
    pub fn get_sync(&self) -> Option<T> {
        self.fallback(self.cell.get_sync())
    }

    /// Blocking [`SafeCell::set`]
    pub fn set_sync(&self, value: Option<T>) {
        self.swallow(self.cell.set_sync(value));
    }

    /// Blocking [`SafeCell::force_set`]
    pub fn force_set_sync(&self, value: Option<T>) {
        self.swallow(self.cell.force_set_sync(value));
    }
}

fn present<K: std::fmt::Debug, T>(key: &K, value: Option<T>) -> T {
    match value {
        Some(value) => value,
        None => panic!("non-null cell {key:?} read an absent value without a default"),
    }
}

/// Cell whose values are never absent
///
/// Reading absence without a configured default is a programmer error and
/// panics.
#[derive(Debug, Clone)]
pub struct NonNullCell<K, T, S> {
    cell: Cell<K, T, S>,
}

impl<K, T, S> NonNullCell<K, T, S>
where
    K: CellKey,
    T: ObjectValue,
    S: StoredValue,
{
    /// Wrap a cell
    #[inline]
    #[must_use]
    pub fn new(cell: Cell<K, T, S>) -> Self {
        Self { cell }
    }

    /// Wrapped cell
    #[inline]
    #[must_use]
    pub fn inner(&self) -> &Cell<K, T, S> {
        &self.cell
    }

    /// Current value
    ///
    /// # Errors
    /// Same as [`Cell::get`].
    ///
    /// # Panics
    /// Panics if the entry is absent and no default is configured.
    pub async fn get(&self) -> CellResult<T> {
        let value = self.cell.get().await?;
        Ok(present(self.cell.key(), value))
    }

    /// Observe the value
    ///
    /// # Panics
    /// The stream panics when it reads absence without a default.
    #[must_use]
    pub fn observe(&self) -> BoxStream<'static, CellResult<T>> {
        let key = self.cell.key().clone();
        self.cell
            .observe()
            .map(move |item| item.map(|value| present(&key, value)))
            .boxed()
    }

    /// Write `value` unless unchanged
    ///
    /// # Errors
    /// Same as [`Cell::set`].
    pub async fn set(&self, value: T) -> CellResult<()> {
        self.cell.set(Some(value)).await
    }

    /// Write `value` unconditionally
    ///
    /// # Errors
    /// Same as [`Cell::force_set`].
    pub async fn force_set(&self, value: T) -> CellResult<()> {
        self.cell.force_set(Some(value)).await
    }

    /// Blocking [`NonNullCell::get`]
    ///
    /// # Errors
    /// Same as [`Cell::get`].
    ///
    /// # Panics
    /// Panics if the entry is absent and no default is configured.
    pub fn get_sync(&self) -> CellResult<T> {
        let value = self.cell.get_sync()?;
        Ok(present(self.cell.key(), value))
    }

    /// Blocking [`NonNullCell::set`]
    ///
    /// # Errors
    /// Same as [`Cell::set`].
    pub fn set_sync(&self, value: T) -> CellResult<()> {
        self.cell.set_sync(Some(value))
    }
}

/// Never-failing cell whose values are never absent
///
/// Built only with a default, which every failure falls back to.
#[derive(Debug, Clone)]
pub struct SafeNonNullCell<K, T, S> {
    cell: SafeCell<K, T, S>,
    default: T,
}

impl<K, T, S> SafeNonNullCell<K, T, S>
where
    K: CellKey,
    T: ObjectValue,
    S: StoredValue,
{
    pub(crate) fn new(cell: SafeCell<K, T, S>, default: T) -> Self {
        Self { cell, default }
    }

    /// Wrapped cell
    #[inline]
    #[must_use]
    pub fn inner(&self) -> &Cell<K, T, S> {
        self.cell.inner()
    }

    /// Current value
    pub async fn get(&self) -> T {
        self.cell.get().await.unwrap_or_else(|| self.default.clone())
    }

    /// Observe the value
    #[must_use]
    pub fn observe(&self) -> BoxStream<'static, T> {
        let default = self.default.clone();
        self.cell
            .observe()
            .map(move |value| value.unwrap_or_else(|| default.clone()))
            .boxed()
    }

    /// Write `value` unless unchanged
    pub async fn set(&self, value: T) {
        self.cell.set(Some(value)).await;
    }

    /// Write `value` unconditionally
    pub async fn force_set(&self, value: T) {
        self.cell.force_set(Some(value)).await;
    }

    /// Blocking [`SafeNonNullCell::get`]
    #[must_use]
    pub fn get_sync(&self) -> T {
        self.cell.get_sync().unwrap_or_else(|| self.default.clone())
    }

    /// Blocking [`SafeNonNullCell::set`]
    pub fn set_sync(&self, value: T) {
        self.cell.set_sync(Some(value));
    }
}
