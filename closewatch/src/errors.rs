//! Error types for closewatch.
//!
//! Close failures are never wrapped: a [`Closer`](crate::Closer) reports the
//! resource's own error type. The only error this crate defines is for the
//! construction path that may need an OS thread.

use std::fmt;
use thiserror::Error;

/// The watcher thread could not be spawned.
///
/// Carries the resource back to the caller. It has not been closed.
#[derive(Error)]
#[error("failed to spawn close watcher thread: {source}")]
pub struct SpawnError<R> {
    resource: R,
    #[source]
    source: std::io::Error,
}

impl<R> SpawnError<R> {
    pub(crate) const fn new(resource: R, source: std::io::Error) -> Self {
        Self { resource, source }
    }

    /// Returns the unclosed resource.
    #[must_use]
    pub fn into_resource(self) -> R {
        self.resource
    }

    /// Returns the underlying OS error.
    #[must_use]
    pub const fn io_error(&self) -> &std::io::Error {
        &self.source
    }
}

impl<R> fmt::Debug for SpawnError<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnError")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}
