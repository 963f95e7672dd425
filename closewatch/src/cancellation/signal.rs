//! The cancellation-signal abstraction consumed by [`Closer`](crate::Closer).

use async_trait::async_trait;
use std::sync::Arc;

/// What a cancellation signal can still do, determined without blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalState {
    /// No cancellation mechanism is attached; the signal will never fire.
    Never,
    /// The signal has not fired yet but may fire later.
    Pending,
    /// The signal has already fired. Cancellation is level-triggered, so it
    /// stays in this state.
    Cancelled,
}

impl SignalState {
    /// Returns true if the signal has fired.
    #[must_use]
    pub const fn is_cancelled(self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns true if the signal may still fire in the future.
    #[must_use]
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// A source of cancellation.
#[async_trait]
pub trait CancelSignal: Send + Sync {
    /// Classifies the signal without blocking.
    fn state(&self) -> SignalState;

    /// Completes once the signal has fired.
    ///
    /// For a signal in [`SignalState::Never`] this never completes.
    async fn cancelled(&self);
}

/// A signal that can never fire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Never;

#[async_trait]
impl CancelSignal for Never {
    fn state(&self) -> SignalState {
        SignalState::Never
    }

    async fn cancelled(&self) {
        std::future::pending::<()>().await;
    }
}

/// `None` behaves like [`Never`].
#[async_trait]
impl<S: CancelSignal> CancelSignal for Option<S> {
    fn state(&self) -> SignalState {
        self.as_ref().map_or(SignalState::Never, |signal| signal.state())
    }

    async fn cancelled(&self) {
        match self {
            Some(signal) => signal.cancelled().await,
            None => std::future::pending::<()>().await,
        }
    }
}

#[async_trait]
impl<S: CancelSignal + ?Sized> CancelSignal for Arc<S> {
    fn state(&self) -> SignalState {
        (**self).state()
    }

    async fn cancelled(&self) {
        (**self).cancelled().await;
    }
}

#[async_trait]
impl<S: CancelSignal + ?Sized> CancelSignal for Box<S> {
    fn state(&self) -> SignalState {
        (**self).state()
    }

    async fn cancelled(&self) {
        (**self).cancelled().await;
    }
}

/// A tokio-util token can always be cancelled, so it is never [`SignalState::Never`].
#[async_trait]
impl CancelSignal for tokio_util::sync::CancellationToken {
    fn state(&self) -> SignalState {
        if self.is_cancelled() {
            SignalState::Cancelled
        } else {
            SignalState::Pending
        }
    }

    async fn cancelled(&self) {
        tokio_util::sync::CancellationToken::cancelled(self).await;
    }
}
