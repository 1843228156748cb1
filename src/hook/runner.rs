//! Drives one transaction through the sentinel lifecycle.
//!
//! `run_start` creates the sentinel, opens a transaction once the watch sees
//! it, and closes the transaction when the sentinel is removed. `run_stop`
//! removes the sentinel so a waiting `run_start` can finish.

use crate::flag::{FileFlag, FileFlagBuilder, FlagError, WatchBackend, DEFAULT_RECONCILE_INTERVAL};
use crate::hook::transaction::{JobContext, JobStatus, JobStatusSource, TransactionReporter};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Default budget for flushing the reporter before exit.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors from running the hook.
#[derive(Error, Debug)]
pub enum HookError {
    #[error(transparent)]
    Flag(#[from] FlagError),

    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Settings for one `run_start`.
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Sentinel path.
    pub flag: PathBuf,
    /// Attributes of the observed job.
    pub context: JobContext,
    /// Interval between reconciliation stats.
    pub reconcile_interval: Duration,
    /// Notification backend for the flag.
    pub backend: WatchBackend,
    /// Budget for flushing the reporter.
    pub shutdown_timeout: Duration,
}

impl StartOptions {
    /// Options with default intervals and the native backend.
    pub fn new(flag: impl Into<PathBuf>, context: JobContext) -> Self {
        Self {
            flag: flag.into(),
            context,
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            backend: WatchBackend::Native,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Runs the hook against a reporter and a job status source.
#[derive(Clone)]
pub struct HookRunner {
    reporter: Arc<dyn TransactionReporter>,
    status: Arc<dyn JobStatusSource>,
}

impl HookRunner {
    pub fn new(
        reporter: impl TransactionReporter + 'static,
        status: impl JobStatusSource + 'static,
    ) -> Self {
        Self {
            reporter: Arc::new(reporter),
            status: Arc::new(status),
        }
    }

    /// Observe one sentinel lifecycle and report it as a transaction.
    ///
    /// Returns the status attached to the transaction. Does not return
    /// before the flag is `Done` and the reporter has been flushed.
    pub async fn run_start(&self, options: StartOptions) -> Result<JobStatus, HookError> {
        let flag = Arc::new(
            FileFlagBuilder::new(&options.flag)
                .reconcile_interval(options.reconcile_interval)
                .backend(options.backend)
                .build()?,
        );
        let watch = crate::spawn_watcher(Arc::clone(&flag));

        blocking(&flag, FileFlag::wait_for_watch).await?;
        touch_file(&options.flag)?;

        tracing::debug!("Waiting for {} to appear", options.flag.display());
        wait_or_interrupt(&flag, FileFlag::wait_for_start).await?;

        if flag.lock().finished() {
            // Closed before the sentinel ever showed up; nothing to report.
            watch.await??;
            return Ok(JobStatus::Unknown);
        }

        let mut txn = self
            .reporter
            .start_transaction(&options.context.transaction_name());
        for (key, value) in options.context.attributes() {
            txn.add_attribute(key, &value);
        }

        tracing::info!("Waiting for {} to be removed", options.flag.display());
        wait_or_interrupt(&flag, FileFlag::wait).await?;

        let status = match self.status.job_status(&options.context) {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!("Could not get job status: {:#}", e);
                JobStatus::Unknown
            }
        };
        tracing::info!("Job status: {}", status);

        txn.add_attribute("status", status.as_str());
        txn.end();
        flag.close();

        self.flush(options.shutdown_timeout).await?;

        blocking(&flag, FileFlag::wait_for_done).await?;
        match watch.await? {
            Ok(exit) => tracing::debug!("Watch finished: {:?}", exit),
            Err(e) => tracing::warn!("Watch ended with error: {}", e),
        }

        Ok(status)
    }

    async fn flush(&self, timeout: Duration) -> Result<(), HookError> {
        tracing::debug!("Flushing reporter (budget {:?})", timeout);
        let reporter = Arc::clone(&self.reporter);
        let shutdown = tokio::task::spawn_blocking(move || reporter.shutdown(timeout));

        match tokio::time::timeout(timeout, shutdown).await {
            Ok(joined) => {
                if let Err(e) = joined? {
                    tracing::warn!("Reporter shutdown failed: {:#}", e);
                }
            }
            Err(_) => tracing::warn!("Reporter shutdown exceeded {:?}", timeout),
        }
        Ok(())
    }

    /// Remove the sentinel, releasing any `run_start` waiting on it.
    ///
    /// Returns whether there was a sentinel to remove.
    pub fn run_stop(&self, flag: &Path) -> Result<bool, HookError> {
        let removed = remove_flag(flag)?;
        if removed {
            tracing::info!("Removed {}", flag.display());
        } else {
            tracing::debug!("{} does not exist, nothing to do", flag.display());
        }
        Ok(removed)
    }
}

/// Run a blocking flag wait on the blocking pool.
async fn blocking<F>(flag: &Arc<FileFlag>, wait: F) -> Result<(), HookError>
where
    F: FnOnce(&FileFlag) + Send + 'static,
{
    let flag = Arc::clone(flag);
    tokio::task::spawn_blocking(move || wait(&flag)).await?;
    Ok(())
}

/// Like [`blocking`], but ctrl-c closes the flag instead of waiting on.
async fn wait_or_interrupt<F>(flag: &Arc<FileFlag>, wait: F) -> Result<(), HookError>
where
    F: FnOnce(&FileFlag) + Send + 'static,
{
    tokio::select! {
        res = blocking(flag, wait) => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, closing {}", flag.path().display());
            flag.close();
            Ok(())
        }
    }
}

/// Create an empty file at `path` unless one exists, creating parent
/// directories as needed.
pub fn touch_file(path: &Path) -> Result<(), HookError> {
    let io_err = |source| HookError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err)?;
    Ok(())
}

/// Remove the file at `path`. A missing file is not an error.
pub fn remove_flag(path: &Path) -> Result<bool, HookError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(HookError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::transaction::{TracingReporter, UnknownStatus};

    struct FixedStatus(JobStatus);

    impl JobStatusSource for FixedStatus {
        fn job_status(&self, _context: &JobContext) -> anyhow::Result<JobStatus> {
            Ok(self.0)
        }
    }

    struct BrokenStatus;

    impl JobStatusSource for BrokenStatus {
        fn job_status(&self, _context: &JobContext) -> anyhow::Result<JobStatus> {
            anyhow::bail!("rate limited")
        }
    }

    fn context() -> JobContext {
        JobContext {
            repo: "acme/widgets".to_string(),
            workflow: "CI".to_string(),
            job: "build".to_string(),
            branch: "main".to_string(),
            ..JobContext::default()
        }
    }

    async fn wait_until_exists(path: &Path) {
        for _ in 0..500 {
            if path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never appeared", path.display());
    }

    /// Run the hook while another task plays the external writer.
    async fn run_lifecycle(
        status: impl JobStatusSource + 'static,
    ) -> (Result<JobStatus, HookError>, TracingReporter) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hook.flag");
        let reporter = TracingReporter::new();
        let runner = HookRunner::new(reporter.clone(), status);

        let mut options = StartOptions::new(&path, context());
        options.shutdown_timeout = Duration::from_secs(5);
        let task = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run_start(options).await })
        };

        wait_until_exists(&path).await;
        // Give the watch a full reconciliation interval to see the file.
        tokio::time::sleep(DEFAULT_RECONCILE_INTERVAL * 2).await;
        assert!(runner.run_stop(&path).unwrap());

        let result = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("hook did not finish")
            .unwrap();
        (result, reporter)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_start_reports_one_transaction() {
        let (result, reporter) = run_lifecycle(UnknownStatus).await;
        assert_eq!(result.unwrap(), JobStatus::Unknown);

        let finished = reporter.finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].name, "CI / build");
        assert_eq!(finished[0].attribute("branch"), Some("main"));
        assert_eq!(finished[0].attribute("status"), Some("unknown"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_start_attaches_status() {
        let (result, reporter) = run_lifecycle(FixedStatus(JobStatus::Failure)).await;
        assert_eq!(result.unwrap(), JobStatus::Failure);
        assert_eq!(reporter.finished()[0].attribute("status"), Some("failure"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_status_lookup_failure_is_unknown() {
        let (result, reporter) = run_lifecycle(BrokenStatus).await;
        assert_eq!(result.unwrap(), JobStatus::Unknown);
        assert_eq!(reporter.finished()[0].attribute("status"), Some("unknown"));
    }

    #[tokio::test]
    async fn test_run_start_missing_parent() {
        let dir = tempfile::tempdir().unwrap();
        let runner = HookRunner::new(TracingReporter::new(), UnknownStatus);
        let options = StartOptions::new(dir.path().join("missing").join("hook.flag"), context());

        let err = runner.run_start(options).await.unwrap_err();
        assert!(matches!(err, HookError::Flag(FlagError::MissingParent { .. })));
    }

    #[test]
    fn test_touch_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("hook.flag");

        touch_file(&path).unwrap();
        assert!(path.is_file());
        // Touching again keeps the file.
        touch_file(&path).unwrap();

        assert!(remove_flag(&path).unwrap());
        assert!(!remove_flag(&path).unwrap());
    }

    #[test]
    fn test_run_stop_without_flag() {
        let dir = tempfile::tempdir().unwrap();
        let runner = HookRunner::new(TracingReporter::new(), UnknownStatus);
        assert!(!runner.run_stop(&dir.path().join("hook.flag")).unwrap());
    }
}
