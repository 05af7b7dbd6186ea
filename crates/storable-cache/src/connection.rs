//! Handle to a running upstream computation

use std::fmt;

/// Disposal hook for one generation's upstream
///
/// Dropping the connection disposes it. The cache drops it exactly once,
/// outside its lock, when the generation ends.
pub struct Connection {
    dispose: Option<Box<dyn FnOnce() + Send>>,
}

impl Connection {
    /// Create connection with a disposal hook
    #[inline]
    #[must_use]
    pub fn new<F>(dispose: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    /// Connection with nothing to dispose
    #[inline]
    #[must_use]
    pub fn none() -> Self {
        Self { dispose: None }
    }

    /// Dispose now
    #[inline]
    pub fn dispose(self) {
        drop(self);
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::none()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("pending", &self.dispose.is_some())
            .finish()
    }
}
