//! Representation transforms between object and stored values
//!
//! A [`Converter<A, B>`] maps the in-memory type `A` to the stored type `B`
//! and back. Absence is part of both domains: converters receive and return
//! `Option`s so that an absent entry can map to a present value (or the other
//! way round) when a representation needs it.

use crate::error::ConversionError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Bidirectional, possibly failing transform
pub trait Converter<A, B>: Send + Sync {
    /// Convert an object value to its stored form
    ///
    /// # Errors
    /// Returns `ConversionError::ToStored` if the value has no stored form.
    fn to_stored(&self, value: Option<&A>) -> Result<Option<B>, ConversionError>;

    /// Convert a stored value to its object form
    ///
    /// # Errors
    /// Returns `ConversionError::ToObject` if the stored data is malformed.
    fn to_object(&self, stored: Option<&B>) -> Result<Option<A>, ConversionError>;
}

impl<A, B, C> Converter<A, B> for Arc<C>
where
    C: Converter<A, B> + ?Sized,
{
    #[inline]
    fn to_stored(&self, value: Option<&A>) -> Result<Option<B>, ConversionError> {
        (**self).to_stored(value)
    }

    #[inline]
    fn to_object(&self, stored: Option<&B>) -> Result<Option<A>, ConversionError> {
        (**self).to_object(stored)
    }
}

/// Converter for cells whose object and stored types are the same
pub struct IdentityConverter<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> IdentityConverter<T> {
    /// Create identity converter
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for IdentityConverter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for IdentityConverter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IdentityConverter")
    }
}

impl<T: Clone> Converter<T, T> for IdentityConverter<T> {
    fn to_stored(&self, value: Option<&T>) -> Result<Option<T>, ConversionError> {
        Ok(value.cloned())
    }

    fn to_object(&self, stored: Option<&T>) -> Result<Option<T>, ConversionError> {
        Ok(stored.cloned())
    }
}

/// Stores any serde type as a JSON string
pub struct JsonConverter<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonConverter<T> {
    /// Create JSON converter
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonConverter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonConverter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonConverter")
    }
}

impl<T> Converter<T, String> for JsonConverter<T>
where
    T: Serialize + DeserializeOwned,
{
    fn to_stored(&self, value: Option<&T>) -> Result<Option<String>, ConversionError> {
        value
            .map(|value| {
                serde_json::to_string(value).map_err(|e| ConversionError::ToStored(e.to_string()))
            })
            .transpose()
    }

    fn to_object(&self, stored: Option<&String>) -> Result<Option<T>, ConversionError> {
        stored
            .map(|json| {
                serde_json::from_str(json).map_err(|e| ConversionError::ToObject(e.to_string()))
            })
            .transpose()
    }
}

type ConvertFn<X, Y> = Box<dyn Fn(&X) -> Result<Y, ConversionError> + Send + Sync>;

/// Converter built from a pair of closures
///
/// Absent values stay absent in both directions.
pub struct FnConverter<A, B> {
    to_stored: ConvertFn<A, B>,
    to_object: ConvertFn<B, A>,
}

impl<A, B> FnConverter<A, B> {
    /// Create converter from forward and backward transforms
    pub fn new<F, G>(to_stored: F, to_object: G) -> Self
    where
        F: Fn(&A) -> Result<B, ConversionError> + Send + Sync + 'static,
        G: Fn(&B) -> Result<A, ConversionError> + Send + Sync + 'static,
    {
        Self {
            to_stored: Box::new(to_stored),
            to_object: Box::new(to_object),
        }
    }
}

impl<A, B> fmt::Debug for FnConverter<A, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnConverter")
    }
}

impl<A, B> Converter<A, B> for FnConverter<A, B> {
    fn to_stored(&self, value: Option<&A>) -> Result<Option<B>, ConversionError> {
        value.map(|value| (self.to_stored)(value)).transpose()
    }

    fn to_object(&self, stored: Option<&B>) -> Result<Option<A>, ConversionError> {
        stored.map(|stored| (self.to_object)(stored)).transpose()
    }
}

/// Converter decorator that never fails
///
/// A failed conversion is logged and yields an absent value.
#[derive(Debug, Clone)]
pub struct SafeConverter<C> {
    inner: C,
}

impl<C> SafeConverter<C> {
    /// Wrap a converter
    #[inline]
    #[must_use]
    pub fn new(inner: C) -> Self {
        Self { inner }
    }
}

impl<A, B, C> Converter<A, B> for SafeConverter<C>
where
    C: Converter<A, B>,
{
    fn to_stored(&self, value: Option<&A>) -> Result<Option<B>, ConversionError> {
        Ok(self.inner.to_stored(value).unwrap_or_else(|error| {
            tracing::warn!(error = %error, "conversion to stored form failed, using absent");
            None
        }))
    }

    fn to_object(&self, stored: Option<&B>) -> Result<Option<A>, ConversionError> {
        Ok(self.inner.to_object(stored).unwrap_or_else(|error| {
            tracing::warn!(error = %error, "conversion to object form failed, using absent");
            None
        }))
    }
}
