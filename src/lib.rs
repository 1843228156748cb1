//! Sentinel Hook
//!
//! This crate turns a sentinel file into a process lifecycle. An external
//! actor creates the file to say "started" and removes it to say "finished";
//! the hook reports the span in between as one monitoring transaction.
//!
//! ## The hard part
//!
//! Producers race each other to trigger one-shot transitions, blocked
//! waiters must be released exactly once, and filesystem notifications get
//! dropped (queue overflow, or a file created before the watch registers).
//! Two pieces handle this:
//!
//! 1. [`SoftLock`](lifecycle::SoftLock): a three-phase lock whose
//!    transitions each fire exactly once and are observed by any number of
//!    past or future waiters.
//! 2. [`FileFlag`](flag::FileFlag): watches the sentinel's parent directory
//!    and maps create/remove events onto the lock, with a periodic stat that
//!    repairs the lock when an event is lost.
//!
//! ```text
//! external writer: create / remove
//!        ↓
//! parent directory watch (native or polling)
//!        ↓
//! FileFlag::watch() [BACKGROUND THREAD] ←── 200ms reconciliation stat
//!        ↓
//! SoftLock start() / release()
//!        ↓
//! wait_for_start() / wait() / wait_for_done() callers resume
//! ```
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use sentinel_hook::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let flag = Arc::new(FileFlag::new("/tmp/job.flag")?);
//!     let watch = sentinel_hook::spawn_watcher(Arc::clone(&flag));
//!
//!     let waiter = Arc::clone(&flag);
//!     tokio::task::spawn_blocking(move || waiter.wait()).await?;
//!
//!     flag.close();
//!     watch.await??;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Structure
//!
//! - [`lifecycle`]: one-shot signals and the three-phase lock
//! - [`flag`]: sentinel file watching
//!   - [`flag::watcher`]: parent-directory notification backends
//!   - [`flag::file_flag`]: the watch loop and reconciliation
//! - [`hook`]: transaction reporting around the lifecycle
//!   - [`hook::transaction`]: reporter and job status seams
//!   - [`hook::runner`]: the `start` and `stop` flows

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod flag;
pub mod hook;
pub mod lifecycle;

use std::sync::Arc;

/// Re-exports for convenience.
pub mod prelude {
    pub use crate::flag::{FileFlag, FileFlagBuilder, FlagError, WatchBackend, WatchExit};
    pub use crate::hook::{
        HookError, HookRunner, JobContext, JobStatus, JobStatusSource, StartOptions,
        TracingReporter, Transaction, TransactionReporter, UnknownStatus,
    };
    pub use crate::lifecycle::{Phase, Signal, SoftLock};
}

/// Run a flag's watch loop on tokio's blocking pool.
///
/// A loop that fails closes the flag, so nothing waiting on it is left
/// hanging. A rejected second loop leaves the running one alone.
pub fn spawn_watcher(
    flag: Arc<flag::FileFlag>,
) -> tokio::task::JoinHandle<Result<flag::WatchExit, flag::FlagError>> {
    tokio::task::spawn_blocking(move || {
        let result = flag.watch();
        match &result {
            Ok(_) | Err(crate::flag::FlagError::AlreadyWatching { .. }) => {}
            Err(_) => flag.close(),
        }
        result
    })
}
