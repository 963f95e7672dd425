//! Configuration for closers and their watchers.

use crate::cancellation::CancelSignal;
use crate::close::Close;
use crate::closer::{self, Closer};
use crate::errors::SpawnError;
use serde::{Deserialize, Serialize};

/// Default stack size for a dedicated watcher thread.
///
/// The thread only parks on two wake-ups, so it needs very little stack.
pub const DEFAULT_THREAD_STACK_SIZE: usize = 64 * 1024;

/// Where the background watcher runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherStrategy {
    /// A tokio task when called inside a runtime, otherwise a dedicated thread.
    #[default]
    Auto,
    /// Always a dedicated thread.
    Thread,
}

/// Configuration for [`Closer`] construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloserConfig {
    /// Label attached to log events and the watcher thread name.
    pub label: Option<String>,
    /// Where the watcher runs.
    pub strategy: WatcherStrategy,
    /// Stack size for a dedicated watcher thread, in bytes.
    pub thread_stack_size: usize,
}

impl Default for CloserConfig {
    fn default() -> Self {
        Self {
            label: None,
            strategy: WatcherStrategy::Auto,
            thread_stack_size: DEFAULT_THREAD_STACK_SIZE,
        }
    }
}

impl CloserConfig {
    /// Creates a new configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the diagnostic label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Sets the watcher strategy.
    #[must_use]
    pub const fn with_strategy(mut self, strategy: WatcherStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the watcher thread stack size.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, bytes: usize) -> Self {
        self.thread_stack_size = bytes;
        self
    }

    /// Wraps `resource` so it is closed exactly once, when the returned
    /// handle is closed or when `signal` fires, whichever comes first.
    ///
    /// # Panics
    ///
    /// Panics if a watcher thread is needed and the OS refuses to create it.
    /// Use [`try_close_when_done`](Self::try_close_when_done) to handle that.
    pub fn close_when_done<S, R>(&self, signal: S, resource: R) -> Closer<R>
    where
        S: CancelSignal + 'static,
        R: Close + Send + Sync + 'static,
        R::Error: Send + Sync,
    {
        match closer::build(self, signal, resource) {
            Ok(closer) => closer,
            Err(e) => panic!("{e}"),
        }
    }

    /// Like [`close_when_done`](Self::close_when_done), but hands the
    /// resource back, unclosed, if the watcher thread cannot be spawned.
    pub fn try_close_when_done<S, R>(
        &self,
        signal: S,
        resource: R,
    ) -> Result<Closer<R>, SpawnError<R>>
    where
        S: CancelSignal + 'static,
        R: Close + Send + Sync + 'static,
        R::Error: Send + Sync,
    {
        closer::build(self, signal, resource)
    }
}
