//! The cancellable closer adapter.

use crate::cancellation::{CancelSignal, SignalState};
use crate::close::Close;
use crate::config::CloserConfig;
use crate::errors::SpawnError;
use crate::watcher::{self, StoppedRx};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Wraps `resource` so that it is closed exactly once: when the returned
/// [`Closer`] is closed, or when `signal` fires, whichever comes first.
///
/// How the closer is built depends on the signal's state at call time:
///
/// - [`SignalState::Never`]: no watcher is started; closing the handle simply
///   closes the resource once.
/// - [`SignalState::Cancelled`]: the resource is closed before this function
///   returns, and the handle replays that result.
/// - [`SignalState::Pending`]: a single watcher is started. It closes the
///   resource if the signal fires first, and exits as soon as the handle is
///   closed.
///
/// Close the returned handle once the resource is no longer used; that also
/// releases the watcher. Dropping the handle without closing it closes the
/// resource as well.
///
/// ```rust
/// use closewatch::prelude::*;
/// use closewatch::testing::CountingCloser;
/// use std::sync::Arc;
///
/// let token = CancellationToken::new();
/// let conn = Arc::new(CountingCloser::<()>::ok());
/// let closer = close_when_done(token.clone(), Arc::clone(&conn));
///
/// token.cancel("shutdown");
/// conn.wait_for_close();
///
/// assert!(closer.close().is_ok());
/// assert_eq!(conn.count(), 1);
/// ```
///
/// # Panics
///
/// Panics if a watcher thread is needed and cannot be spawned. See
/// [`CloserConfig::try_close_when_done`].
pub fn close_when_done<S, R>(signal: S, resource: R) -> Closer<R>
where
    S: CancelSignal + 'static,
    R: Close + Send + Sync + 'static,
    R::Error: Send + Sync,
{
    CloserConfig::default().close_when_done(signal, resource)
}

pub(crate) fn build<S, R>(
    config: &CloserConfig,
    signal: S,
    resource: R,
) -> Result<Closer<R>, SpawnError<R>>
where
    S: CancelSignal + 'static,
    R: Close + Send + Sync + 'static,
    R::Error: Send + Sync,
{
    let label = config.label.clone();

    match signal.state() {
        SignalState::Never => Ok(Closer {
            state: State::Open {
                shared: Arc::new(Shared::new(resource)),
                watcher: None,
            },
            label,
        }),
        SignalState::Cancelled => {
            let result = resource.close();
            debug!(label = ?label, result = ?result, "signal already cancelled, resource closed");
            Ok(Closer {
                state: State::Closed(result),
                label,
            })
        }
        SignalState::Pending => {
            let shared = Arc::new(Shared::new(resource));
            let stage_rx = shared.subscribe();
            match watcher::spawn(config, signal, Arc::downgrade(&shared), stage_rx) {
                Ok(stopped) => Ok(Closer {
                    state: State::Open {
                        shared,
                        watcher: Some(stopped),
                    },
                    label,
                }),
                Err(source) => match Arc::try_unwrap(shared) {
                    Ok(shared) => Err(SpawnError::new(shared.resource, source)),
                    // The watcher never ran, so it cannot hold a strong reference.
                    Err(_) => unreachable!("close watcher failed to start but holds the resource"),
                },
            }
        }
    }
}

/// Progress of the single resource close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Open,
    /// The guard is claimed and the resource close is running.
    Closing,
    /// The resource close has returned or panicked.
    Closed,
}

/// State shared between a [`Closer`] and its watcher.
pub(crate) struct Shared<R: Close> {
    resource: R,
    /// Set before the resource close runs and held while it runs.
    claimed: Mutex<bool>,
    /// Empty after a close that panicked.
    result: OnceLock<Result<(), R::Error>>,
    stage_tx: watch::Sender<Stage>,
}

/// Publishes [`Stage::Closed`] when dropped, including during unwinding.
struct MarkClosed<'a>(&'a watch::Sender<Stage>);

impl Drop for MarkClosed<'_> {
    fn drop(&mut self) {
        self.0.send_replace(Stage::Closed);
    }
}

impl<R: Close> Shared<R> {
    fn new(resource: R) -> Self {
        let (stage_tx, _) = watch::channel(Stage::Open);
        Self {
            resource,
            claimed: Mutex::new(false),
            result: OnceLock::new(),
            stage_tx,
        }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Stage> {
        self.stage_tx.subscribe()
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.stage_tx.borrow() == Stage::Closed
    }

    /// Closes the resource unless the guard was already claimed, blocking
    /// while another caller's close is running.
    ///
    /// Returns the stored result and whether this call performed the close.
    /// The result is `None` if the resource close panicked.
    pub(crate) fn close_once(&self) -> (Option<&Result<(), R::Error>>, bool) {
        let ran = self.close_claimed(self.claimed.lock());
        (self.result.get(), ran)
    }

    /// Like [`close_once`](Self::close_once), but returns `false` at once
    /// if another caller holds the guard.
    pub(crate) fn close_if_idle(&self) -> bool {
        self.claimed
            .try_lock()
            .is_some_and(|claimed| self.close_claimed(claimed))
    }

    fn close_claimed(&self, mut claimed: MutexGuard<'_, bool>) -> bool {
        if *claimed {
            return false;
        }
        *claimed = true;

        let _mark = MarkClosed(&self.stage_tx);
        // Lets the watcher exit before the resource close starts.
        self.stage_tx.send_replace(Stage::Closing);
        let _ = self.result.set(self.resource.close());
        true
    }

    /// The outcome replayed to callers once the resource is closed.
    fn outcome(&self) -> Option<Result<(), R::Error>>
    where
        R::Error: Clone,
    {
        if !self.is_closed() {
            return None;
        }
        Some(self.result.get().cloned().unwrap_or(Ok(())))
    }
}

enum State<R: Close> {
    /// The resource is open, or was closed through `Shared`.
    Open {
        shared: Arc<Shared<R>>,
        watcher: Option<StoppedRx>,
    },
    /// The signal had already fired at construction.
    Closed(Result<(), R::Error>),
}

/// A handle that closes its resource exactly once.
///
/// Returned by [`close_when_done`]. Implements [`Close`], so it can stand in
/// for the wrapped resource. Every call to [`Close::close`] returns the
/// result of the single real close, whichever path performed it.
pub struct Closer<R: Close> {
    state: State<R>,
    label: Option<String>,
}

impl<R: Close> Closer<R> {
    /// Returns true once the resource has been closed, by any path.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        match &self.state {
            State::Open { shared, .. } => shared.is_closed(),
            State::Closed(_) => true,
        }
    }

    /// Returns the diagnostic label from the configuration, if any.
    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Completes once the resource has been closed, by any path.
    pub async fn closed(&self) {
        if let State::Open { shared, .. } = &self.state {
            let mut rx = shared.subscribe();
            let _ = rx.wait_for(|stage| *stage == Stage::Closed).await;
        }
    }

    /// Completes once the background watcher has exited.
    ///
    /// Completes immediately when no watcher was started.
    pub async fn watcher_stopped(&self) {
        if let State::Open {
            watcher: Some(stopped),
            ..
        } = &self.state
        {
            let mut stopped = stopped.clone();
            while stopped.changed().await.is_ok() {}
        }
    }
}

impl<R> Closer<R>
where
    R: Close,
    R::Error: Clone,
{
    /// Returns the stored close result without closing anything.
    ///
    /// `None` until the resource close has finished.
    #[must_use]
    pub fn result(&self) -> Option<Result<(), R::Error>> {
        match &self.state {
            State::Open { shared, .. } => shared.outcome(),
            State::Closed(result) => Some(result.clone()),
        }
    }
}

impl<R> Close for Closer<R>
where
    R: Close,
    R::Error: Clone,
{
    type Error = R::Error;

    fn close(&self) -> Result<(), R::Error> {
        match &self.state {
            // A resource close that panicked left no error to replay.
            State::Open { shared, .. } => shared.close_once().0.cloned().unwrap_or(Ok(())),
            State::Closed(result) => result.clone(),
        }
    }
}

impl<R: Close> Drop for Closer<R> {
    fn drop(&mut self) {
        let State::Open { shared, .. } = &self.state else {
            return;
        };
        let (result, ran) = shared.close_once();
        if !ran {
            return;
        }
        match result {
            Some(Err(e)) => {
                warn!(label = ?self.label, error = ?e, "closing resource on drop failed");
            }
            _ => debug!(label = ?self.label, "closer dropped while open, resource closed"),
        }
    }
}

impl<R: Close> fmt::Debug for Closer<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closer")
            .field("label", &self.label)
            .field("closed", &self.is_closed())
            .field(
                "watching",
                &matches!(
                    self.state,
                    State::Open {
                        watcher: Some(_),
                        ..
                    }
                ),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::{CancellationToken, Never};
    use crate::close::close_fn;
    use crate::config::WatcherStrategy;
    use crate::testing::CountingCloser;
    use parking_lot::Condvar;
    use pretty_assertions::assert_eq;
    use std::io;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;
    use tracing_subscriber::EnvFilter;

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("bork")]
    struct Bork;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn bork_closer() -> Arc<CountingCloser<Bork>> {
        Arc::new(CountingCloser::failing(Bork))
    }

    /// A resource whose close counts the call and then panics.
    fn panicking_resource(
        calls: &Arc<AtomicUsize>,
    ) -> impl Close<Error = Bork> + Send + Sync + 'static {
        let calls = Arc::clone(calls);
        close_fn(move || -> Result<(), Bork> {
            calls.fetch_add(1, Ordering::SeqCst);
            panic!("resource close blew up");
        })
    }

    #[test]
    fn test_never_signal_closes_once() {
        let c1 = Arc::new(CountingCloser::<Bork>::ok());

        let c2 = close_when_done(Never, Arc::clone(&c1));
        assert_eq!(c1.count(), 0);
        assert!(!c2.is_closed());

        assert_eq!(c2.close(), Ok(()));
        assert_eq!(c1.count(), 1);
        assert!(c2.is_closed());
    }

    #[test]
    fn test_never_signal_starts_no_watcher() {
        let c2 = close_when_done(None::<CancellationToken>, bork_closer());
        assert!(matches!(c2.state, State::Open { watcher: None, .. }));
        futures::executor::block_on(c2.watcher_stopped());
    }

    #[test]
    fn test_error_forwarded() {
        let c1 = bork_closer();

        let c2 = close_when_done(Never, Arc::clone(&c1));
        assert_eq!(c1.count(), 0);

        assert_eq!(c2.close(), Err(Bork));
        assert_eq!(c1.count(), 1);
    }

    #[test]
    fn test_close_twice() {
        let c1 = bork_closer();

        let c2 = close_when_done(Never, Arc::clone(&c1));
        assert_eq!(c1.count(), 0);

        assert_eq!(c2.close(), Err(Bork));
        assert_eq!(c1.count(), 1);

        assert_eq!(c2.close(), Err(Bork));
        assert_eq!(c1.count(), 1);
    }

    #[test]
    fn test_already_cancelled() {
        init_tracing();
        let token = CancellationToken::new();
        token.cancel("before construction");
        let c1 = bork_closer();

        let c2 = close_when_done(token, Arc::clone(&c1));
        assert_eq!(c1.count(), 1);
        assert!(c2.is_closed());
        assert_eq!(c2.result(), Some(Err(Bork)));

        assert_eq!(c2.close(), Err(Bork));
        assert_eq!(c2.close(), Err(Bork));
        assert_eq!(c1.count(), 1);

        drop(c2);
        assert_eq!(c1.count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_close() {
        init_tracing();
        let token = CancellationToken::new();
        let c1 = bork_closer();

        let c2 = close_when_done(token.clone(), Arc::clone(&c1));
        assert_eq!(c1.count(), 0);
        assert_eq!(c2.result(), None);

        token.cancel("shutdown");
        c2.closed().await;
        assert_eq!(c1.count(), 1);
        c2.watcher_stopped().await;

        assert_eq!(c2.close(), Err(Bork));
        assert_eq!(c1.count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_before_close_wait_for_close() {
        let token = CancellationToken::new();
        let c1 = bork_closer();

        let c2 = close_when_done(token.clone(), Arc::clone(&c1));

        token.cancel("shutdown");
        let count = tokio::task::spawn_blocking({
            let c1 = Arc::clone(&c1);
            move || c1.wait_for_close()
        })
        .await
        .unwrap();
        assert_eq!(count, 1);

        assert_eq!(c2.close(), Err(Bork));
        assert_eq!(c1.count(), 1);
    }

    #[tokio::test]
    async fn test_close_before_cancel() {
        init_tracing();
        let token = CancellationToken::new();
        let c1 = bork_closer();

        let c2 = close_when_done(token.clone(), Arc::clone(&c1));
        assert_eq!(c1.count(), 0);

        assert_eq!(c2.close(), Err(Bork));
        assert_eq!(c1.count(), 1);

        // Once the watcher is gone nothing can close the resource again.
        c2.watcher_stopped().await;
        token.cancel("late");
        tokio::task::yield_now().await;
        assert_eq!(c1.count(), 1);
        assert_eq!(c2.close(), Err(Bork));
    }

    #[tokio::test]
    async fn test_cancel_right_after_close() {
        let token = CancellationToken::new();
        let c1 = bork_closer();

        let c2 = close_when_done(token.clone(), Arc::clone(&c1));
        assert_eq!(c2.close(), Err(Bork));
        token.cancel("late");

        c2.watcher_stopped().await;
        assert_eq!(c1.count(), 1);
    }

    #[tokio::test]
    async fn test_error_replayed_verbatim() {
        let token = CancellationToken::new();
        let err = Arc::new(io::Error::new(io::ErrorKind::BrokenPipe, "peer went away"));
        let c1 = Arc::new(CountingCloser::failing(Arc::clone(&err)));

        let c2 = close_when_done(token.clone(), Arc::clone(&c1));
        token.cancel("shutdown");
        c2.closed().await;

        for _ in 0..3 {
            let got = c2.close().unwrap_err();
            assert!(Arc::ptr_eq(&got, &err));
        }
        assert_eq!(c1.count(), 1);
    }

    #[tokio::test]
    async fn test_tokio_util_token() {
        let token = tokio_util::sync::CancellationToken::new();
        let c1 = bork_closer();

        let c2 = close_when_done(token.child_token(), Arc::clone(&c1));
        token.cancel();
        c2.closed().await;

        assert_eq!(c1.count(), 1);
        assert_eq!(c2.close(), Err(Bork));
    }

    #[tokio::test]
    async fn test_drop_closes_and_stops_watcher() {
        let token = CancellationToken::new();
        let c1 = bork_closer();

        let c2 = close_when_done(token.clone(), Arc::clone(&c1));
        let State::Open {
            watcher: Some(stopped),
            ..
        } = &c2.state
        else {
            panic!("expected a watcher");
        };
        let mut stopped = stopped.clone();

        drop(c2);
        assert_eq!(c1.count(), 1);

        while stopped.changed().await.is_ok() {}
        token.cancel("after drop");
        assert_eq!(c1.count(), 1);
    }

    #[test]
    fn test_drop_without_watcher_closes() {
        let c1 = bork_closer();
        let c2 = close_when_done(Never, Arc::clone(&c1));

        drop(c2);
        assert_eq!(c1.count(), 1);
    }

    #[test]
    fn test_drop_after_close_does_not_reclose() {
        let c1 = bork_closer();
        let c2 = close_when_done(Never, Arc::clone(&c1));

        let _ = c2.close();
        drop(c2);
        assert_eq!(c1.count(), 1);
    }

    #[test]
    fn test_concurrent_closes() {
        let c1 = bork_closer();
        let c2 = Arc::new(close_when_done(Never, Arc::clone(&c1)));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let c2 = Arc::clone(&c2);
                std::thread::spawn(move || c2.close())
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), Err(Bork));
        }
        assert_eq!(c1.count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_races_close() {
        for _ in 0..100 {
            let token = CancellationToken::new();
            let c1 = bork_closer();
            let c2 = Arc::new(close_when_done(token.clone(), Arc::clone(&c1)));

            let canceller = tokio::spawn(async move { token.cancel("race") });
            let closer = tokio::spawn({
                let c2 = Arc::clone(&c2);
                async move { c2.close() }
            });

            canceller.await.unwrap();
            assert_eq!(closer.await.unwrap(), Err(Bork));
            c2.watcher_stopped().await;
            assert_eq!(c1.count(), 1);
        }
    }

    #[test]
    fn test_thread_watcher_without_runtime() {
        init_tracing();
        let token = CancellationToken::new();
        let c1 = bork_closer();

        let c2 = close_when_done(token.clone(), Arc::clone(&c1));
        assert_eq!(c1.count(), 0);

        token.cancel("shutdown");
        assert_eq!(c1.wait_for_close_timeout(Duration::from_secs(5)), Some(1));
        futures::executor::block_on(c2.watcher_stopped());

        assert_eq!(c2.close(), Err(Bork));
        assert_eq!(c1.count(), 1);
    }

    #[test]
    fn test_thread_strategy_close_before_cancel() {
        let config = CloserConfig::new()
            .with_label("socket")
            .with_strategy(WatcherStrategy::Thread);
        let token = CancellationToken::new();
        let c1 = bork_closer();

        let c2 = config.close_when_done(token.clone(), Arc::clone(&c1));
        assert_eq!(c2.label(), Some("socket"));

        assert_eq!(c2.close(), Err(Bork));
        futures::executor::block_on(c2.watcher_stopped());
        token.cancel("late");
        assert_eq!(c1.count(), 1);
    }

    #[test]
    fn test_runtime_dropped_then_cancel() {
        init_tracing();
        let token = CancellationToken::new();
        let c1 = bork_closer();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let c2 = runtime.block_on(async { close_when_done(token.clone(), Arc::clone(&c1)) });
        drop(runtime);
        assert_eq!(c1.count(), 0);

        token.cancel("after runtime shutdown");
        assert_eq!(c1.wait_for_close_timeout(Duration::from_secs(5)), Some(1));
        futures::executor::block_on(c2.closed());
        assert!(c2.is_closed());

        assert_eq!(c2.close(), Err(Bork));
        assert_eq!(c1.count(), 1);
    }

    #[test]
    fn test_runtime_dropped_then_close() {
        let token = CancellationToken::new();
        let c1 = bork_closer();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let c2 = runtime.block_on(async { close_when_done(token.clone(), Arc::clone(&c1)) });
        drop(runtime);

        assert_eq!(c2.close(), Err(Bork));
        futures::executor::block_on(c2.watcher_stopped());
        token.cancel("late");
        assert_eq!(c1.count(), 1);
    }

    #[test]
    fn test_panicking_close_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c2 = close_when_done(Never, panicking_resource(&calls));

        assert!(catch_unwind(AssertUnwindSafe(|| c2.close())).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(c2.is_closed());

        assert_eq!(c2.close(), Ok(()));
        assert_eq!(c2.result(), Some(Ok(())));
        drop(c2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_close_on_cancel_runs_once() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c2 = close_when_done(token.clone(), panicking_resource(&calls));

        token.cancel("shutdown");
        c2.closed().await;
        c2.watcher_stopped().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(c2.close(), Ok(()));
        drop(c2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_watcher_exits_during_slow_close() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(Barrier::new(2));
        let gate = Arc::new((Mutex::new(false), Condvar::new()));

        let resource = close_fn({
            let calls = Arc::clone(&calls);
            let started = Arc::clone(&started);
            let gate = Arc::clone(&gate);
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                started.wait();
                let (open, cond) = &*gate;
                let mut open = open.lock();
                cond.wait_while(&mut open, |open| !*open);
                Err::<(), _>(Bork)
            }
        });
        let c2 = Arc::new(close_when_done(token.clone(), resource));

        let closing = tokio::task::spawn_blocking({
            let c2 = Arc::clone(&c2);
            move || c2.close()
        });
        tokio::task::spawn_blocking(move || {
            started.wait();
        })
        .await
        .unwrap();

        // The resource close is still blocked on the gate.
        c2.watcher_stopped().await;
        assert!(!c2.is_closed());
        token.cancel("during close");

        {
            let (open, cond) = &*gate;
            *open.lock() = true;
            cond.notify_all();
        }
        assert_eq!(closing.await.unwrap(), Err(Bork));
        assert!(c2.is_closed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_try_close_when_done() {
        let token = CancellationToken::new();
        let c1 = bork_closer();

        let c2 = CloserConfig::new()
            .try_close_when_done(token, Arc::clone(&c1))
            .unwrap();
        assert_eq!(c2.close(), Err(Bork));
        assert_eq!(c1.count(), 1);
    }

    #[test]
    fn test_closer_is_a_close() {
        fn close_it<C: Close>(c: &C) -> Result<(), C::Error> {
            c.close()
        }

        let c1 = bork_closer();
        let c2 = close_when_done(Never, Arc::clone(&c1));
        let nested = close_when_done(Never, c2);

        assert_eq!(close_it(&nested), Err(Bork));
        assert_eq!(close_it(&nested), Err(Bork));
        assert_eq!(c1.count(), 1);
    }
}
