//! Cancellation token for cooperative cancellation.

use super::{CancelSignal, SignalState};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::warn;

/// A callback type for cancellation notifications. Receives the reason.
pub type CancelCallback = Box<dyn FnOnce(&str) + Send>;

#[derive(Default)]
struct TokenState {
    /// Whether cancellation has been requested.
    cancelled: AtomicBool,
    /// The reason for cancellation (first one wins).
    reason: RwLock<Option<String>>,
    /// Callbacks to invoke on cancellation.
    callbacks: Mutex<Vec<CancelCallback>>,
    /// Child tokens to cancel along with this one. Dead entries are pruned
    /// whenever a child is added.
    children: Mutex<Vec<Weak<TokenState>>>,
    /// Wakes tasks parked in `cancelled()`.
    notify: Notify,
}

/// A cloneable token for cooperative cancellation.
///
/// Clones share state: cancelling one cancels all of them. Cancellation is
/// idempotent and level-triggered; only the first reason is kept and the
/// token never returns to the uncancelled state.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenState>,
}

impl CancellationToken {
    /// Creates a new cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token that is cancelled whenever `self` is.
    ///
    /// Cancelling the child does not affect the parent. The parent keeps
    /// only a weak reference, so dropped children are not retained.
    #[must_use]
    pub fn child_token(&self) -> Self {
        let child = Self::new();
        {
            let mut children = self.inner.children.lock();
            // Checked under the lock so a concurrent `cancel` either takes
            // this child or we see its flag.
            if !self.is_cancelled() {
                children.retain(|weak| weak.strong_count() > 0);
                children.push(Arc::downgrade(&child.inner));
                return child;
            }
        }
        child.cancel(self.reason().unwrap_or_default());
        child
    }

    /// Requests cancellation with a reason.
    ///
    /// This is idempotent - only the first reason is kept.
    /// Callbacks are invoked immediately. Panics in callbacks are logged and suppressed.
    pub fn cancel(&self, reason: impl Into<String>) {
        let state = &self.inner;
        let reason = reason.into();
        {
            // Held across the flag flip so readers that observe the flag also
            // observe the reason.
            let mut slot = state.reason.write();
            if state
                .cancelled
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
            *slot = Some(reason.clone());
        }
        state.notify.notify_waiters();

        let callbacks: Vec<CancelCallback> = std::mem::take(&mut *state.callbacks.lock());
        for callback in callbacks {
            run_callback(callback, &reason);
        }

        let children: Vec<Weak<TokenState>> = std::mem::take(&mut *state.children.lock());
        for inner in children.iter().filter_map(Weak::upgrade) {
            Self { inner }.cancel(reason.as_str());
        }
    }

    /// Registers a callback to be invoked on cancellation.
    ///
    /// If already cancelled, the callback is invoked immediately.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: FnOnce(&str) + Send + 'static,
    {
        {
            let mut callbacks = self.inner.callbacks.lock();
            // Checked under the lock so a concurrent `cancel` either sees
            // this callback or we see its flag.
            if !self.is_cancelled() {
                callbacks.push(Box::new(callback));
                return;
            }
        }
        let reason = self.reason().unwrap_or_default();
        run_callback(Box::new(callback), &reason);
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.read().clone()
    }

    /// Completes once the token is cancelled.
    ///
    /// Does not depend on a particular async runtime.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

fn run_callback(callback: CancelCallback, reason: &str) {
    if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        callback(reason);
    })) {
        warn!("Cancellation callback panicked: {:?}", e);
    }
}

#[async_trait]
impl CancelSignal for CancellationToken {
    fn state(&self) -> SignalState {
        if self.is_cancelled() {
            SignalState::Cancelled
        } else {
            SignalState::Pending
        }
    }

    async fn cancelled(&self) {
        Self::cancelled(self).await;
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}
