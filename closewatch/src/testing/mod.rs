//! Testing utilities for code that uses closers.
//!
//! This module provides:
//! - CountingCloser, a fake resource that counts closes and can block until one happens

mod mocks;

pub use mocks::CountingCloser;
