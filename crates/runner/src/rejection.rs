//! Pluggable behaviour for submissions that do not fit the accept queue.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use gantry_core::RejectionKind;

use crate::pool::task::TaskCore;
use crate::pool::BoundedScheduledPool;

/// Why a submission was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The accept queue is full.
    QueueFull { queued: usize, limit: usize },
    /// The pool no longer accepts jobs.
    Shutdown,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::QueueFull { queued, limit } => {
                write!(f, "accept queue full ({queued} queued, limit {limit})")
            }
            RejectReason::Shutdown => f.write_str("pool is shut down"),
        }
    }
}

/// Error a policy returns to make the submitter see the rejection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("job {seq} rejected by pool '{pool}': {reason}")]
pub struct RejectedError {
    pub pool: String,
    pub seq: u64,
    pub reason: RejectReason,
}

/// A job the pool refused to queue.
///
/// The policy may run it inline, resubmit it or simply drop it. Dropping it
/// settles the submitter's handle as rejected.
pub struct RejectedJob {
    task: Option<Arc<TaskCore>>,
    seq: u64,
    periodic: bool,
    delay: Duration,
    reason: RejectReason,
}

impl RejectedJob {
    pub(crate) fn new(task: Arc<TaskCore>, delay: Duration, reason: RejectReason) -> Self {
        Self {
            seq: task.seq(),
            periodic: task.schedule().is_periodic(),
            task: Some(task),
            delay,
            reason,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.seq
    }

    pub fn reason(&self) -> RejectReason {
        self.reason
    }

    pub fn is_periodic(&self) -> bool {
        self.periodic
    }

    /// The initial delay requested at submission.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Error describing this rejection, for policies that report it.
    pub fn to_error(&self, pool: &BoundedScheduledPool) -> RejectedError {
        RejectedError {
            pool: pool.name().to_string(),
            seq: self.seq,
            reason: self.reason,
        }
    }

    /// Run the job now on the calling thread, ignoring its delay. Later runs
    /// of a periodic job are queued on the pool directly.
    pub fn run_inline(mut self, pool: &BoundedScheduledPool) {
        if let Some(task) = self.task.take() {
            pool.run_inline(task);
        }
    }

    /// Offer the job to the pool again, going through the queue bound.
    pub fn resubmit(mut self, pool: &BoundedScheduledPool) -> Result<(), RejectedError> {
        match self.task.take() {
            Some(task) => pool.offer(task, self.delay),
            None => Ok(()),
        }
    }
}

impl Drop for RejectedJob {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.settle_rejected();
        }
    }
}

impl fmt::Debug for RejectedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RejectedJob")
            .field("seq", &self.seq)
            .field("periodic", &self.periodic)
            .field("reason", &self.reason)
            .finish()
    }
}

/// Invoked synchronously on the submitting thread when a job is rejected.
///
/// Returning `Err` makes the submission call fail with
/// [`crate::PoolError::Rejected`]; returning `Ok` makes it return the
/// (possibly settled) handle.
pub trait RejectionPolicy: Send + Sync {
    fn rejected(&self, job: RejectedJob, pool: &BoundedScheduledPool) -> Result<(), RejectedError>;

    /// Short name for logs.
    fn name(&self) -> &str {
        "custom"
    }
}

/// Report the rejection to the submitter.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbortPolicy;

impl RejectionPolicy for AbortPolicy {
    fn rejected(&self, job: RejectedJob, pool: &BoundedScheduledPool) -> Result<(), RejectedError> {
        Err(job.to_error(pool))
    }

    fn name(&self) -> &str {
        "abort"
    }
}

/// Run the job on the submitting thread, unless the pool is shut down.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallerRunsPolicy;

impl RejectionPolicy for CallerRunsPolicy {
    fn rejected(&self, job: RejectedJob, pool: &BoundedScheduledPool) -> Result<(), RejectedError> {
        if job.reason() == RejectReason::Shutdown || pool.is_shutdown() {
            debug!(pool = %pool.name(), job = job.sequence(), "pool shut down, discarding job");
            return Ok(());
        }
        debug!(pool = %pool.name(), job = job.sequence(), "running rejected job on caller thread");
        job.run_inline(pool);
        Ok(())
    }

    fn name(&self) -> &str {
        "caller_runs"
    }
}

/// Drop the job.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardPolicy;

impl RejectionPolicy for DiscardPolicy {
    fn rejected(&self, job: RejectedJob, pool: &BoundedScheduledPool) -> Result<(), RejectedError> {
        debug!(pool = %pool.name(), job = job.sequence(), "discarding rejected job");
        Ok(())
    }

    fn name(&self) -> &str {
        "discard"
    }
}

/// Drop the job at the head of the queue and retry the submission.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardOldestPolicy;

impl RejectionPolicy for DiscardOldestPolicy {
    fn rejected(&self, job: RejectedJob, pool: &BoundedScheduledPool) -> Result<(), RejectedError> {
        if job.reason() == RejectReason::Shutdown || pool.is_shutdown() {
            return Ok(());
        }
        if pool.remove_oldest() {
            job.resubmit(pool)
        } else {
            // nothing queued to make room for it
            Ok(())
        }
    }

    fn name(&self) -> &str {
        "discard_oldest"
    }
}

/// Built-in policy for a configured [`RejectionKind`].
pub fn policy_for(kind: RejectionKind) -> Arc<dyn RejectionPolicy> {
    match kind {
        RejectionKind::Abort => Arc::new(AbortPolicy),
        RejectionKind::CallerRuns => Arc::new(CallerRunsPolicy),
        RejectionKind::Discard => Arc::new(DiscardPolicy),
        RejectionKind::DiscardOldest => Arc::new(DiscardOldestPolicy),
    }
}
