//! Pre-write validation

use crate::error::ValidationError;

/// Checks a candidate value before it is written
pub trait Validator<T>: Send + Sync {
    /// Validate `value`
    ///
    /// # Errors
    /// Returns `ValidationError` if the value must not be written.
    fn validate(&self, value: Option<&T>) -> Result<(), ValidationError>;
}

impl<T, F> Validator<T> for F
where
    F: Fn(Option<&T>) -> Result<(), ValidationError> + Send + Sync,
{
    fn validate(&self, value: Option<&T>) -> Result<(), ValidationError> {
        self(value)
    }
}
