//! Content equality for write short-circuiting
//!
//! Cells skip a backend write when the candidate equals the value already
//! known. That comparison must look at content: two absent values are equal
//! and sequences compare element by element, never by identity.

/// Compare two possibly-absent values by content
///
/// `Vec`, slices and arrays compare element-wise through their `PartialEq`
/// implementations, so nested collections are compared deeply.
#[inline]
#[must_use]
pub fn deep_equals<T>(left: Option<&T>, right: Option<&T>) -> bool
where
    T: PartialEq + ?Sized,
{
    match (left, right) {
        (None, None) => true,
        (Some(left), Some(right)) => left == right,
        _ => false,
    }
}
