//! Cancellation signals.
//!
//! This module provides:
//! - CancelSignal, the non-blocking three-state classification plus an async wait
//! - Never, a signal that is permanently inert
//! - CancellationToken, a cloneable token with reasons, callbacks and child tokens

mod signal;
mod token;

pub use signal::{CancelSignal, Never, SignalState};
pub use token::{CancelCallback, CancellationToken};
