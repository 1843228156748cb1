//! Sentinel file bridged onto a [`SoftLock`].
//!
//! A `FileFlag` watches one path. The file appearing starts the lock and the
//! file disappearing releases it. A periodic stat reconciles the lock with
//! the filesystem whenever notifications go missing.

use crate::flag::watcher::{
    classify, parent_dir, watch_dir, EventReceiver, FlagError, FlagEventKind, WatchBackend,
};
use crate::lifecycle::{Signal, SoftLock};
use notify::Watcher;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Mutex, PoisonError, TryLockError};
use std::time::{Duration, Instant};

/// Default interval between reconciliation stats.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_millis(200);

/// Why a [`FileFlag::watch`] loop ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchExit {
    /// The sentinel was removed.
    Released,
    /// The notification handle was closed.
    Closed,
    /// The lock reached `Done` while the loop was running.
    Finished,
}

/// Watches a sentinel path on behalf of one [`SoftLock`].
pub struct FileFlag {
    path: PathBuf,
    dir: PathBuf,
    leaf: OsString,
    lock: SoftLock,
    watcher: Mutex<Option<Box<dyn Watcher + Send>>>,
    events: Mutex<EventReceiver>,
    watching: Signal,
    reconcile_interval: Duration,
    backend: WatchBackend,
}

impl std::fmt::Debug for FileFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileFlag")
            .field("path", &self.path)
            .field("lock", &self.lock)
            .field("watching", &self.watching.is_set())
            .field("backend", &self.backend)
            .finish()
    }
}

impl FileFlag {
    /// Watch `path` with the native backend and default reconciliation.
    ///
    /// The parent directory must already exist.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, FlagError> {
        FileFlagBuilder::new(path).build()
    }

    pub(crate) fn from_parts(
        path: PathBuf,
        watcher: Option<Box<dyn Watcher + Send>>,
        events: EventReceiver,
        reconcile_interval: Duration,
        backend: WatchBackend,
    ) -> Result<Self, FlagError> {
        let leaf = path
            .file_name()
            .map(|name| name.to_os_string())
            .ok_or_else(|| FlagError::NoFileName { path: path.clone() })?;

        Ok(Self {
            dir: parent_dir(&path),
            path,
            leaf,
            lock: SoftLock::new(),
            watcher: Mutex::new(watcher),
            events: Mutex::new(events),
            watching: Signal::new(),
            reconcile_interval,
            backend,
        })
    }

    /// The watched path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The lock driven by this flag.
    ///
    /// Owners call [`SoftLock::done`] through this once their own work for
    /// the entity is finished.
    pub fn lock(&self) -> &SoftLock {
        &self.lock
    }

    /// The backend feeding events.
    pub fn backend(&self) -> WatchBackend {
        self.backend
    }

    /// Whether the flag relies on directory polling.
    pub fn is_using_polling(&self) -> bool {
        matches!(self.backend, WatchBackend::Poll(_))
    }

    /// Whether a watch loop has begun consuming events.
    pub fn is_watching(&self) -> bool {
        self.watching.is_set()
    }

    /// Run the watch loop on the calling thread.
    ///
    /// Returns when the sentinel is removed, the flag is closed, or the
    /// notification channel fails. Only one loop may run at a time.
    pub fn watch(&self) -> Result<WatchExit, FlagError> {
        let events = match self.events.try_lock() {
            Ok(events) => events,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                return Err(FlagError::AlreadyWatching {
                    path: self.path.clone(),
                })
            }
        };

        let result = self.run(&events);
        // A loop that bailed before listening must not strand watch waiters.
        self.watching.fire();

        match &result {
            Ok(exit) => tracing::debug!("Watch on {} ended: {:?}", self.path.display(), exit),
            Err(e) => tracing::error!("Watch on {} failed: {}", self.path.display(), e),
        }
        result
    }

    fn run(&self, events: &EventReceiver) -> Result<WatchExit, FlagError> {
        if self.exists()? {
            tracing::debug!("Flag {} already exists, starting", self.path.display());
            self.lock.start();
        }

        self.watching.fire();

        // Reconciliation runs on its own schedule; traffic for other names in
        // the directory must not postpone it.
        let mut last_reconcile = Instant::now();
        loop {
            if self.lock.finished() {
                return Ok(WatchExit::Finished);
            }

            if last_reconcile.elapsed() >= self.reconcile_interval {
                last_reconcile = Instant::now();
                if let Some(exit) = self.reconcile()? {
                    return Ok(exit);
                }
            }

            let budget = self
                .reconcile_interval
                .saturating_sub(last_reconcile.elapsed());
            match events.recv_timeout(budget) {
                Ok(Ok(event)) => match classify(&event, &self.leaf) {
                    Some(FlagEventKind::Created) => {
                        tracing::debug!("Flag {} created", self.path.display());
                        self.lock.start();
                    }
                    Some(FlagEventKind::Removed) => {
                        tracing::debug!("Flag {} removed", self.path.display());
                        self.lock.release();
                        return Ok(WatchExit::Released);
                    }
                    Some(FlagEventKind::Other) | None => {
                        tracing::trace!("Ignoring {:?}", event);
                    }
                },
                Ok(Err(e)) => {
                    // The channel can no longer be trusted to report removal.
                    self.close();
                    return Err(FlagError::Notify(e));
                }
                // Reconciliation is due; handled at the top of the loop.
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Ok(WatchExit::Closed),
            }
        }
    }

    /// Bring the lock in line with what is on disk.
    fn reconcile(&self) -> Result<Option<WatchExit>, FlagError> {
        // Closed while we slept; the missing file is not a removal.
        if self.lock.finished() {
            return Ok(Some(WatchExit::Finished));
        }

        let exists = self.exists()?;
        tracing::trace!("Reconciling {} (exists={})", self.path.display(), exists);

        if exists {
            if self.lock.start() {
                tracing::warn!(
                    "Missed creation event for {}, started by reconciliation",
                    self.path.display()
                );
            }
            return Ok(None);
        }

        if self.lock.started() {
            tracing::warn!(
                "Missed removal event for {}, released by reconciliation",
                self.path.display()
            );
            self.lock.release();
            return Ok(Some(WatchExit::Released));
        }

        Ok(None)
    }

    fn exists(&self) -> Result<bool, FlagError> {
        match fs::metadata(&self.path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(FlagError::Stat {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Block until a watch loop is listening.
    ///
    /// Producers call this before creating the sentinel so the creation
    /// cannot slip past an unregistered watch.
    pub fn wait_for_watch(&self) {
        self.watching.wait();
    }

    /// Like [`wait_for_watch`](Self::wait_for_watch) with a bound.
    pub fn wait_for_watch_timeout(&self, timeout: Duration) -> bool {
        self.watching.wait_timeout(timeout)
    }

    /// Block until the sentinel exists.
    pub fn wait_for_start(&self) {
        self.wait_for_watch();
        self.lock.wait_for_start();
    }

    /// Like [`wait_for_start`](Self::wait_for_start) with a bound covering
    /// both steps.
    pub fn wait_for_start_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait_for_start();
            return true;
        };
        if !self.wait_for_watch_timeout(timeout) {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.lock.wait_for_start_timeout(remaining)
    }

    /// Block until the sentinel has come and gone.
    pub fn wait(&self) {
        self.wait_for_start();
        self.lock.wait();
    }

    /// Like [`wait`](Self::wait) with a bound.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        if !self.wait_for_start_timeout(timeout) {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.lock.wait_timeout(remaining)
    }

    /// Block until the lock is `Done`.
    pub fn wait_for_done(&self) {
        self.lock.wait_for_done();
    }

    /// Tear down the notification handle and force the lock to `Done`.
    ///
    /// Safe to call more than once.
    pub fn close(&self) {
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(mut watcher) = watcher {
            if let Err(e) = watcher.unwatch(&self.dir) {
                tracing::debug!("Failed to unwatch {}: {}", self.dir.display(), e);
            }
            drop(watcher);
            tracing::debug!("Closed watcher for {}", self.path.display());
        }

        self.lock.close();
    }

    /// Close `flag` if there is one.
    pub fn close_opt(flag: Option<&FileFlag>) {
        if let Some(flag) = flag {
            flag.close();
        }
    }
}

impl Drop for FileFlag {
    fn drop(&mut self) {
        self.close();
    }
}

/// Builder for [`FileFlag`] with sensible defaults.
#[derive(Debug, Clone)]
pub struct FileFlagBuilder {
    path: PathBuf,
    reconcile_interval: Duration,
    backend: WatchBackend,
}

impl FileFlagBuilder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            backend: WatchBackend::Native,
        }
    }

    pub fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    pub fn backend(mut self, backend: WatchBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn build(self) -> Result<FileFlag, FlagError> {
        if self.path.file_name().is_none() {
            return Err(FlagError::NoFileName { path: self.path });
        }
        let (watcher, events) = watch_dir(&parent_dir(&self.path), self.backend)?;
        FileFlag::from_parts(
            self.path,
            Some(watcher),
            events,
            self.reconcile_interval,
            self.backend,
        )
    }
}
