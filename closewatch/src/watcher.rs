//! The background watcher that closes a resource when its signal fires.
//!
//! One watcher exists per pending [`Closer`](crate::Closer). It races the
//! cancellation signal against the closer's explicit-close notification and
//! exits after whichever completes first.
//!
//! A watcher spawned as a tokio task does not own its runtime. If the runtime
//! drops the task before the race is decided, the watcher moves to a
//! dedicated thread and keeps watching.

use crate::cancellation::CancelSignal;
use crate::close::Close;
use crate::closer::{Shared, Stage};
use crate::config::{CloserConfig, WatcherStrategy};
use futures::future::{self, Either};
use std::pin::pin;
use std::sync::Weak;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Receiver whose sender lives exactly as long as the watcher does.
pub(crate) type StoppedRx = watch::Receiver<()>;

/// Everything a watcher needs, wherever it runs.
struct Parts<S, R: Close> {
    signal: S,
    shared: Weak<Shared<R>>,
    stage_rx: watch::Receiver<Stage>,
    label: Option<String>,
    _stopped: watch::Sender<()>,
}

impl<S, R> Parts<S, R>
where
    S: CancelSignal,
    R: Close,
{
    /// Whether the closer still exists and nobody has started closing it.
    fn still_needed(&self) -> bool {
        self.shared.strong_count() > 0 && *self.stage_rx.borrow() == Stage::Open
    }

    async fn run(&mut self) {
        let label = self.label.as_deref();
        let cancelled = self.signal.cancelled();
        // Also completes if the closer is dropped, since that drops the sender.
        let stage_rx = &mut self.stage_rx;
        let closing = async {
            let _ = stage_rx.wait_for(|stage| *stage != Stage::Open).await;
        };

        match future::select(pin!(cancelled), pin!(closing)).await {
            Either::Left(_) => {
                let Some(shared) = self.shared.upgrade() else {
                    return;
                };
                // A close already in progress is left to finish on its own.
                if shared.close_if_idle() {
                    debug!(label = ?label, "signal cancelled, resource closed");
                }
            }
            Either::Right(_) => {
                debug!(label = ?label, "closer closed, watcher exiting");
            }
        }
    }
}

/// Owns the parts of a task watcher until the race completes. Dropped early,
/// it restarts the watcher on a thread.
struct TaskWatch<S, R>
where
    S: CancelSignal + 'static,
    R: Close + Send + Sync + 'static,
    R::Error: Send + Sync,
{
    parts: Option<Parts<S, R>>,
    stack_size: usize,
}

impl<S, R> Drop for TaskWatch<S, R>
where
    S: CancelSignal + 'static,
    R: Close + Send + Sync + 'static,
    R::Error: Send + Sync,
{
    fn drop(&mut self) {
        let Some(parts) = self.parts.take() else {
            return;
        };
        if !parts.still_needed() {
            return;
        }
        let label = parts.label.clone();
        match spawn_thread(parts, self.stack_size) {
            Ok(()) => debug!(label = ?label, "runtime dropped close watcher, moved to a thread"),
            Err(e) => {
                warn!(
                    label = ?label,
                    error = %e,
                    "runtime dropped close watcher, no thread to move to"
                );
            }
        }
    }
}

/// Starts the watcher for `shared`.
///
/// The returned receiver observes a closed channel once the watcher exits.
pub(crate) fn spawn<S, R>(
    config: &CloserConfig,
    signal: S,
    shared: Weak<Shared<R>>,
    stage_rx: watch::Receiver<Stage>,
) -> std::io::Result<StoppedRx>
where
    S: CancelSignal + 'static,
    R: Close + Send + Sync + 'static,
    R::Error: Send + Sync,
{
    let (stopped_tx, stopped_rx) = watch::channel(());
    let parts = Parts {
        signal,
        shared,
        stage_rx,
        label: config.label.clone(),
        _stopped: stopped_tx,
    };

    if config.strategy == WatcherStrategy::Auto {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let label = parts.label.clone();
            // Built outside the task so a never-polled task still hands off.
            let mut task_watch = TaskWatch {
                parts: Some(parts),
                stack_size: config.thread_stack_size,
            };
            handle.spawn(async move {
                if let Some(parts) = task_watch.parts.as_mut() {
                    parts.run().await;
                }
                task_watch.parts = None;
            });
            debug!(label = ?label, "close watcher spawned as task");
            return Ok(stopped_rx);
        }
    }

    let label = parts.label.clone();
    spawn_thread(parts, config.thread_stack_size)?;
    debug!(label = ?label, "close watcher spawned on dedicated thread");

    Ok(stopped_rx)
}

fn spawn_thread<S, R>(parts: Parts<S, R>, stack_size: usize) -> std::io::Result<()>
where
    S: CancelSignal + 'static,
    R: Close + Send + Sync + 'static,
    R::Error: Send + Sync,
{
    std::thread::Builder::new()
        .name(thread_name(parts.label.as_deref()))
        .stack_size(stack_size)
        .spawn(move || {
            let mut parts = parts;
            futures::executor::block_on(parts.run());
        })?;
    Ok(())
}

fn thread_name(label: Option<&str>) -> String {
    label.map_or_else(|| "closewatch".to_string(), |l| format!("closewatch-{l}"))
}
