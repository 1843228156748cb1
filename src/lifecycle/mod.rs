//! Lifecycle synchronization primitives.
//!
//! This module provides:
//! - `signal`: one-shot broadcast signal
//! - `soft_lock`: three-phase lifecycle lock built on three signals

pub mod signal;
pub mod soft_lock;

pub use signal::Signal;
pub use soft_lock::{Phase, SoftLock};
