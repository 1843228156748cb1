//! The lifecycle hook built on top of [`FileFlag`](crate::flag::FileFlag).
//!
//! This module provides:
//! - `transaction`: reporter and job status traits, plus a `tracing` reporter
//! - `runner`: the `start` and `stop` flows

pub mod runner;
pub mod transaction;

pub use runner::{
    remove_flag, touch_file, HookError, HookRunner, StartOptions, DEFAULT_SHUTDOWN_TIMEOUT,
};
pub use transaction::{
    JobContext, JobStatus, JobStatusSource, TracingReporter, Transaction, TransactionRecord,
    TransactionReporter, UnknownStatus,
};
