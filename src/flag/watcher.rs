//! Parent-directory watcher for a single sentinel path.
//!
//! Notification backends cannot watch a path that does not exist yet, so the
//! sentinel's parent directory is watched instead and events are filtered by
//! leaf name. Both the native backend and the polling backend feed the same
//! channel.

use notify::{
    event::{ModifyKind, RenameMode},
    Config, Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher,
};
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while setting up or running a [`FileFlag`](super::FileFlag).
#[derive(Error, Debug)]
pub enum FlagError {
    #[error("Parent directory {path} does not exist")]
    MissingParent { path: PathBuf },

    #[error("Flag path {path} has no file name")]
    NoFileName { path: PathBuf },

    #[error("Failed to create watcher: {0}")]
    WatcherCreation(#[source] notify::Error),

    #[error("Failed to watch path {path}: {source}")]
    WatchPath {
        path: PathBuf,
        source: notify::Error,
    },

    #[error("Notification channel failed: {0}")]
    Notify(#[source] notify::Error),

    #[error("Failed to stat {path}: {source}")]
    Stat { path: PathBuf, source: io::Error },

    #[error("A watch loop is already running for {path}")]
    AlreadyWatching { path: PathBuf },
}

/// Which notification facility backs a flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WatchBackend {
    /// The platform's native facility (inotify, FSEvents, ...).
    #[default]
    Native,
    /// Directory scans at the given interval, for filesystems without
    /// native notification (NFS, WSL mounts, network drives).
    Poll(Duration),
}

/// What an event means for the sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlagEventKind {
    Created,
    Removed,
    Other,
}

impl From<&EventKind> for FlagEventKind {
    fn from(kind: &EventKind) -> Self {
        match kind {
            EventKind::Create(_) => FlagEventKind::Created,
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => FlagEventKind::Created,
            EventKind::Remove(_) => FlagEventKind::Removed,
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => FlagEventKind::Removed,
            _ => FlagEventKind::Other,
        }
    }
}

pub(crate) type EventReceiver = Receiver<notify::Result<Event>>;

/// Classify `event` for the sentinel named `leaf`.
///
/// Returns `None` when the event concerns some other entry.
pub(crate) fn classify(event: &Event, leaf: &OsStr) -> Option<FlagEventKind> {
    let is_leaf = |path: &PathBuf| path.file_name() == Some(leaf);

    // A rename within the directory reports `[from, to]`.
    if let EventKind::Modify(ModifyKind::Name(RenameMode::Both)) = event.kind {
        if event.paths.get(1).is_some_and(is_leaf) {
            return Some(FlagEventKind::Created);
        }
        if event.paths.first().is_some_and(is_leaf) {
            return Some(FlagEventKind::Removed);
        }
        return None;
    }

    if event.paths.iter().any(is_leaf) {
        Some(FlagEventKind::from(&event.kind))
    } else {
        None
    }
}

/// Directory that holds `path`. A bare file name lives in `.`.
pub(crate) fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Start watching `dir` non-recursively with the chosen backend.
pub(crate) fn watch_dir(
    dir: &Path,
    backend: WatchBackend,
) -> Result<(Box<dyn Watcher + Send>, EventReceiver), FlagError> {
    if !dir.is_dir() {
        return Err(FlagError::MissingParent {
            path: dir.to_path_buf(),
        });
    }

    let (tx, rx) = channel();

    let mut watcher: Box<dyn Watcher + Send> = match backend {
        WatchBackend::Native => {
            let config = Config::default().with_compare_contents(false);
            let watcher = RecommendedWatcher::new(
                move |res: notify::Result<Event>| {
                    let _ = tx.send(res);
                },
                config,
            )
            .map_err(FlagError::WatcherCreation)?;
            Box::new(watcher)
        }
        WatchBackend::Poll(interval) => {
            let config = Config::default()
                .with_poll_interval(interval)
                .with_compare_contents(false);
            let watcher = PollWatcher::new(
                move |res: notify::Result<Event>| {
                    let _ = tx.send(res);
                },
                config,
            )
            .map_err(FlagError::WatcherCreation)?;
            Box::new(watcher)
        }
    };

    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .map_err(|e| FlagError::WatchPath {
            path: dir.to_path_buf(),
            source: e,
        })?;

    tracing::debug!("Watching {} ({:?})", dir.display(), backend);
    Ok((watcher, rx))
}
