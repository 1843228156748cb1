//! Sentinel file tracking.
//!
//! This module provides:
//! - `watcher`: parent-directory notification with native or polling backends
//! - `file_flag`: the watch loop that maps file existence onto a `SoftLock`

pub mod file_flag;
pub mod watcher;

pub use file_flag::{FileFlag, FileFlagBuilder, WatchExit, DEFAULT_RECONCILE_INTERVAL};
pub use watcher::{FlagError, FlagEventKind, WatchBackend};
