//! Futures returned by pool submissions.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::error::JobError;
use crate::pool::task::{JobFailure, TaskCore};
use crate::sync::lock;

/// Lifecycle of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum JobStatus {
    /// Queued, waiting for its trigger time (periodic jobs return here between runs).
    Pending,
    /// Executing on a worker or on a caller-runs thread.
    Running,
    /// One-shot job returned successfully.
    Completed,
    /// Returned an error or panicked. Periodic jobs stop recurring.
    Failed,
    Cancelled,
    /// Never queued: the accept queue was full or the pool shut down.
    Rejected,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

/// Handle to a submitted job: poll its status, cancel it, or wait for its value.
///
/// A rejected submission still returns a handle. It is settled as
/// [`JobStatus::Rejected`] and waiting on it yields [`JobError::Rejected`].
pub struct JobHandle<T> {
    core: Arc<TaskCore>,
    value: Arc<Mutex<Option<T>>>,
}

impl<T> JobHandle<T> {
    pub(crate) fn new(core: Arc<TaskCore>, value: Arc<Mutex<Option<T>>>) -> Self {
        Self { core, value }
    }

    /// Submission sequence number (FIFO tie-break key).
    pub fn sequence(&self) -> u64 {
        self.core.seq()
    }

    pub fn status(&self) -> JobStatus {
        self.core.status()
    }

    /// True once the job can no longer run: completed, failed, cancelled or rejected.
    pub fn is_done(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == JobStatus::Cancelled
    }

    /// Cancel the job. A queued job is removed from the pool immediately;
    /// a running job has its [`crate::Interrupt`] raised when `may_interrupt`.
    ///
    /// Returns `false` if the job had already settled.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        self.core.cancel(may_interrupt)
    }

    /// Run `hook` once the job settles, or now if it already has.
    pub(crate) fn on_settled(&self, hook: impl FnOnce(JobStatus) + Send + 'static) {
        self.core.on_settled(Box::new(hook));
    }

    /// Block until the job settles or `timeout` elapses. Returns `true` if settled.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.core.wait_settled(Some(timeout)).is_terminal()
    }

    /// Block until the job settles and take its value.
    pub fn wait(self) -> Result<T, JobError> {
        match self.core.wait_settled(None) {
            JobStatus::Completed => lock(&self.value)
                .take()
                .ok_or_else(|| JobError::Failed(anyhow::anyhow!("job finished without a value"))),
            JobStatus::Failed => Err(match self.core.take_failure() {
                Some(JobFailure::Error(err)) => JobError::Failed(err),
                Some(JobFailure::Panic(msg)) => JobError::Panicked(msg),
                None => JobError::Failed(anyhow::anyhow!("job failed")),
            }),
            JobStatus::Rejected => Err(JobError::Rejected),
            JobStatus::Cancelled | JobStatus::Pending | JobStatus::Running => {
                Err(JobError::Cancelled)
            }
        }
    }
}

impl<T> fmt::Debug for JobHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("seq", &self.sequence())
            .field("status", &self.status())
            .finish()
    }
}
