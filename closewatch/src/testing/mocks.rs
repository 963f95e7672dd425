//! Fake resources for testing.

use crate::close::Close;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::time::Duration;

/// A resource that counts how often it is closed and returns a fixed result.
///
/// Unlike a real resource it tolerates repeated closes, which makes the
/// count observable.
pub struct CountingCloser<E> {
    result: Result<(), E>,
    close_count: Mutex<usize>,
    cond: Condvar,
}

impl<E> CountingCloser<E> {
    /// Creates a closer that returns `result` from every close.
    #[must_use]
    pub fn new(result: Result<(), E>) -> Self {
        Self {
            result,
            close_count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Creates a closer whose close succeeds.
    #[must_use]
    pub fn ok() -> Self {
        Self::new(Ok(()))
    }

    /// Creates a closer whose close fails with `error`.
    #[must_use]
    pub fn failing(error: E) -> Self {
        Self::new(Err(error))
    }

    /// Returns the number of times the resource was closed.
    #[must_use]
    pub fn count(&self) -> usize {
        *self.close_count.lock()
    }

    /// Blocks until the resource has been closed at least once and returns
    /// the count at that point.
    pub fn wait_for_close(&self) -> usize {
        let mut count = self.close_count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count
    }

    /// Like [`wait_for_close`](Self::wait_for_close), giving up after `timeout`.
    pub fn wait_for_close_timeout(&self, timeout: Duration) -> Option<usize> {
        let mut count = self.close_count.lock();
        if *count == 0 {
            self.cond
                .wait_while_for(&mut count, |count| *count == 0, timeout);
        }
        (*count > 0).then_some(*count)
    }
}

impl<E> Close for CountingCloser<E>
where
    E: Clone + fmt::Debug,
{
    type Error = E;

    fn close(&self) -> Result<(), E> {
        *self.close_count.lock() += 1;
        self.cond.notify_all();
        self.result.clone()
    }
}

impl<E: fmt::Debug> fmt::Debug for CountingCloser<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountingCloser")
            .field("result", &self.result)
            .field("close_count", &self.count())
            .finish()
    }
}
