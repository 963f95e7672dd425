//! The closeable-resource abstraction.

use std::fmt;
use std::sync::Arc;

/// A resource that must be released by an explicit, fallible close.
///
/// Implementations are not required to be idempotent. [`Closer`](crate::Closer)
/// guarantees it calls [`Close::close`] on the wrapped resource at most once.
pub trait Close {
    /// The error reported when closing fails.
    type Error: fmt::Debug;

    /// Releases the resource.
    fn close(&self) -> Result<(), Self::Error>;
}

impl<T: Close + ?Sized> Close for &T {
    type Error = T::Error;

    fn close(&self) -> Result<(), Self::Error> {
        (**self).close()
    }
}

impl<T: Close + ?Sized> Close for Box<T> {
    type Error = T::Error;

    fn close(&self) -> Result<(), Self::Error> {
        (**self).close()
    }
}

impl<T: Close + ?Sized> Close for Arc<T> {
    type Error = T::Error;

    fn close(&self) -> Result<(), Self::Error> {
        (**self).close()
    }
}

/// Adapts a closure into a [`Close`] implementation.
///
/// Useful when the thing to release has no close method of its own, such as
/// deregistering a handle from a registry.
pub struct CloseFn<F> {
    f: F,
}

impl<F, E> CloseFn<F>
where
    F: Fn() -> Result<(), E>,
{
    /// Wraps the closure.
    #[must_use]
    pub const fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F, E> Close for CloseFn<F>
where
    F: Fn() -> Result<(), E>,
    E: fmt::Debug,
{
    type Error = E;

    fn close(&self) -> Result<(), E> {
        (self.f)()
    }
}

impl<F> fmt::Debug for CloseFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseFn").finish_non_exhaustive()
    }
}

/// Shorthand for [`CloseFn::new`].
pub const fn close_fn<F, E>(f: F) -> CloseFn<F>
where
    F: Fn() -> Result<(), E>,
{
    CloseFn::new(f)
}
