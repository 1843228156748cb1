//! Transaction reporting seam.
//!
//! The hook opens one monitoring transaction per run. The backend that
//! receives it, and the service that knows how the job ended, sit behind the
//! traits here. `TracingReporter` is the built-in backend: it emits the
//! transaction as structured log events.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Identifying attributes of the CI job being observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobContext {
    /// `owner/name` of the repository.
    pub repo: String,
    /// Workflow name.
    pub workflow: String,
    /// Job id.
    pub job: String,
    /// Head branch.
    pub branch: String,
    /// Runner executing the job.
    pub runner: String,
    /// User that started the run.
    pub actor: String,
    /// User that triggered this attempt.
    pub triggering_actor: String,
    /// Run number within the workflow.
    pub run_number: String,
    /// Unique run id.
    pub run_id: String,
}

impl JobContext {
    /// Name of the transaction: `"<workflow> / <job>"`.
    pub fn transaction_name(&self) -> String {
        format!("{} / {}", self.workflow, self.job)
    }

    /// Link to the run's page.
    pub fn run_url(&self) -> String {
        format!(
            "https://github.com/{}/actions/runs/{}",
            self.repo, self.run_id
        )
    }

    /// Attributes attached to the transaction when it opens.
    pub fn attributes(&self) -> Vec<(&'static str, String)> {
        vec![
            ("branch", self.branch.clone()),
            ("workflow", self.workflow.clone()),
            ("job", self.job.clone()),
            ("repo", self.repo.clone()),
            ("runner", self.runner.clone()),
            ("actor", self.actor.clone()),
            ("triggering_actor", self.triggering_actor.clone()),
            ("run_number", self.run_number.clone()),
            ("run_id", self.run_id.clone()),
            ("run_url", self.run_url()),
        ]
    }
}

/// Outcome of the observed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Success,
    Failure,
    Unknown,
}

impl JobStatus {
    /// Value stored in the `status` attribute.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Success => "success",
            JobStatus::Failure => "failure",
            JobStatus::Unknown => "unknown",
        }
    }

    /// Fold step conclusions into a job status.
    ///
    /// One failed step fails the job. Steps without a conclusion do not.
    ///
    /// A helper for [`JobStatusSource`] implementations backed by a CI API
    /// that reports per-step conclusions; nothing in this crate calls it.
    pub fn from_conclusions<'a, I>(conclusions: I) -> Self
    where
        I: IntoIterator<Item = Option<&'a str>>,
    {
        let failed = conclusions
            .into_iter()
            .any(|conclusion| conclusion.unwrap_or("unknown") == "failure");
        if failed {
            JobStatus::Failure
        } else {
            JobStatus::Success
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Looks up how the observed job ended.
pub trait JobStatusSource: Send + Sync {
    /// Status for `context`.
    fn job_status(&self, context: &JobContext) -> anyhow::Result<JobStatus>;
}

/// A source that never knows.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnknownStatus;

impl JobStatusSource for UnknownStatus {
    fn job_status(&self, _context: &JobContext) -> anyhow::Result<JobStatus> {
        Ok(JobStatus::Unknown)
    }
}

/// An open monitoring transaction.
pub trait Transaction: Send {
    /// Attach a key/value attribute.
    fn add_attribute(&mut self, key: &str, value: &str);

    /// Close the transaction.
    fn end(self: Box<Self>);
}

/// A monitoring backend.
pub trait TransactionReporter: Send + Sync {
    /// Open a named transaction.
    fn start_transaction(&self, name: &str) -> Box<dyn Transaction>;

    /// Flush buffered data, spending at most `timeout`.
    fn shutdown(&self, timeout: Duration) -> anyhow::Result<()>;
}

/// A finished transaction as seen by [`TracingReporter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    /// Transaction name.
    pub name: String,
    /// Attributes in the order they were added.
    pub attributes: Vec<(String, String)>,
}

impl TransactionRecord {
    /// Last value recorded for `key`.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Reports transactions as `tracing` events and keeps the finished ones.
#[derive(Debug, Clone, Default)]
pub struct TracingReporter {
    finished: Arc<Mutex<Vec<TransactionRecord>>>,
}

impl TracingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transactions ended so far.
    pub fn finished(&self) -> Vec<TransactionRecord> {
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TransactionReporter for TracingReporter {
    fn start_transaction(&self, name: &str) -> Box<dyn Transaction> {
        tracing::info!(transaction = name, "Transaction started");
        Box::new(TracingTransaction {
            record: TransactionRecord {
                name: name.to_string(),
                attributes: Vec::new(),
            },
            started_at: Instant::now(),
            sink: Arc::clone(&self.finished),
        })
    }

    fn shutdown(&self, _timeout: Duration) -> anyhow::Result<()> {
        // Events are written synchronously; nothing is buffered.
        tracing::debug!(transactions = self.finished().len(), "Reporter shut down");
        Ok(())
    }
}

struct TracingTransaction {
    record: TransactionRecord,
    started_at: Instant,
    sink: Arc<Mutex<Vec<TransactionRecord>>>,
}

impl Transaction for TracingTransaction {
    fn add_attribute(&mut self, key: &str, value: &str) {
        tracing::debug!(transaction = %self.record.name, key, value, "Attribute");
        self.record
            .attributes
            .push((key.to_string(), value.to_string()));
    }

    fn end(self: Box<Self>) {
        let TracingTransaction {
            record,
            started_at,
            sink,
        } = *self;
        tracing::info!(
            transaction = %record.name,
            status = record.attribute("status").unwrap_or("unknown"),
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Transaction ended"
        );
        sink.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}
