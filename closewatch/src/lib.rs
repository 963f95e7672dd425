//! # Closewatch
//!
//! Ties the release of a closeable resource to a cancellation signal.
//!
//! [`close_when_done`] wraps a resource and a signal and returns a [`Closer`].
//! The resource is closed exactly once, by whichever happens first:
//!
//! - **Explicit close**: the caller closes the returned handle
//! - **Cancellation**: the signal fires
//!
//! Every later close returns the result of that single real close.
//!
//! ## Quick Start
//!
//! ```rust
//! use closewatch::prelude::*;
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let released = Arc::new(AtomicBool::new(false));
//! let flag = Arc::clone(&released);
//! let conn = close_fn(move || {
//!     flag.store(true, Ordering::SeqCst);
//!     Ok::<(), String>(())
//! });
//!
//! let token = CancellationToken::new();
//! let closer = close_when_done(token.clone(), conn);
//!
//! token.cancel("request aborted");
//! closer.closed().await;
//! assert!(released.load(Ordering::SeqCst));
//!
//! // Already closed by the watcher: replays the stored result.
//! assert_eq!(closer.close(), Ok(()));
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod close;
pub mod closer;
pub mod config;
pub mod errors;
pub mod testing;
mod watcher;

pub use cancellation::{CancelSignal, CancellationToken, Never, SignalState};
pub use close::{close_fn, Close, CloseFn};
pub use closer::{close_when_done, Closer};
pub use config::{CloserConfig, WatcherStrategy};
pub use errors::SpawnError;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{CancelSignal, CancellationToken, Never, SignalState};
    pub use crate::close::{close_fn, Close, CloseFn};
    pub use crate::closer::{close_when_done, Closer};
    pub use crate::config::{CloserConfig, WatcherStrategy};
    pub use crate::errors::SpawnError;
}
