//! Submit a batch of jobs and wait for all of them with a timeout.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::error::{BatchError, BatchTimeout};
use crate::handle::{JobHandle, JobStatus};
use crate::interrupt::Interrupt;
use crate::pool::BoundedScheduledPool;
use crate::sync::{deadline_in, lock, panic_message, wait, wait_timeout};

/// A unit of work submitted as part of a batch.
pub trait BatchJob: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str {
        "batch-job"
    }

    fn run(&self, interrupt: &Interrupt) -> anyhow::Result<()>;
}

/// [`BatchJob`] backed by a closure.
pub struct FnJob<F> {
    name: String,
    f: F,
}

impl<F> FnJob<F>
where
    F: Fn(&Interrupt) -> anyhow::Result<()> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> BatchJob for FnJob<F>
where
    F: Fn(&Interrupt) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, interrupt: &Interrupt) -> anyhow::Result<()> {
        (self.f)(interrupt)
    }
}

impl<F> fmt::Debug for FnJob<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnJob").field("name", &self.name).finish()
    }
}

/// Outcome of a batch, handed to the [`CompletionListener`].
pub struct BatchReport<J: ?Sized> {
    /// Set when the timeout elapsed before every job finished.
    pub timeout: Option<BatchTimeout>,
    /// Jobs that finished, successfully or not.
    pub completed: usize,
    /// Jobs the pool settled as rejected without running them.
    pub rejected: usize,
    /// Jobs still pending or running at the timeout. Each was cancelled.
    pub remaining: Vec<Arc<J>>,
}

impl<J: ?Sized> BatchReport<J> {
    pub fn timed_out(&self) -> bool {
        self.timeout.is_some()
    }
}

impl<J: ?Sized> fmt::Debug for BatchReport<J> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchReport")
            .field("timeout", &self.timeout)
            .field("completed", &self.completed)
            .field("rejected", &self.rejected)
            .field("remaining", &self.remaining.len())
            .finish()
    }
}

/// Receives the batch outcome and decides whether a timeout is an error.
pub trait CompletionListener<J: ?Sized> {
    fn on_complete(&self, report: &BatchReport<J>) -> Result<(), BatchError>;
}

impl<J: ?Sized, F> CompletionListener<J> for F
where
    F: Fn(&BatchReport<J>) -> Result<(), BatchError>,
{
    fn on_complete(&self, report: &BatchReport<J>) -> Result<(), BatchError> {
        self(report)
    }
}

/// Turns a timeout into [`BatchError::Timeout`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FailOnTimeout;

impl<J: ?Sized> CompletionListener<J> for FailOnTimeout {
    fn on_complete(&self, report: &BatchReport<J>) -> Result<(), BatchError> {
        match &report.timeout {
            Some(timeout) => Err(BatchError::Timeout(timeout.clone())),
            None => Ok(()),
        }
    }
}

/// Logs a timeout and carries on.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOnTimeout;

impl<J: ?Sized> CompletionListener<J> for LogOnTimeout {
    fn on_complete(&self, report: &BatchReport<J>) -> Result<(), BatchError> {
        if let Some(timeout) = &report.timeout {
            warn!(
                completed = timeout.completed,
                total = timeout.total,
                remaining = report.remaining.len(),
                "batch timed out"
            );
        }
        Ok(())
    }
}

/// Countdown shared between the waiter and the wrapped jobs.
struct Latch {
    count: Mutex<usize>,
    zero: Condvar,
}

impl Latch {
    fn new(count: usize) -> Self {
        Self { count: Mutex::new(count), zero: Condvar::new() }
    }

    fn count_down(&self) {
        let mut count = lock(&self.count);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.zero.notify_all();
        }
    }

    /// True if the count reached zero before the deadline. Without a
    /// deadline this waits for zero.
    fn wait_until(&self, deadline: Option<Instant>) -> bool {
        let mut count = lock(&self.count);
        while *count > 0 {
            let Some(deadline) = deadline else {
                count = wait(&self.zero, count);
                continue;
            };
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            count = wait_timeout(&self.zero, count, deadline - now);
        }
        true
    }
}

/// Submits batches to a pool and waits for them.
#[derive(Debug, Clone, Copy)]
pub struct BatchWaiter<'a> {
    pool: &'a BoundedScheduledPool,
}

impl<'a> BatchWaiter<'a> {
    pub fn new(pool: &'a BoundedScheduledPool) -> Self {
        Self { pool }
    }

    /// Submit every job and block until all finish or `timeout` elapses.
    ///
    /// Every job counts down once it settles, including jobs the rejection
    /// policy drops at submission or evicts from the queue later on. On
    /// timeout every unsettled job is cancelled (interrupting it if running)
    /// and listed in the report's `remaining`. The listener sees the report
    /// first; its error, if any, is returned.
    pub fn submit_for_complete<J, L>(
        &self,
        jobs: Vec<Arc<J>>,
        timeout: Duration,
        listener: &L,
    ) -> Result<BatchReport<J>, BatchError>
    where
        J: BatchJob + ?Sized,
        L: CompletionListener<J> + ?Sized,
    {
        let deadline = deadline_in(timeout);
        let total = jobs.len();
        let latch = Arc::new(Latch::new(total));
        let completed = Arc::new(AtomicUsize::new(0));
        let rejected = Arc::new(AtomicUsize::new(0));
        let mut submitted: Vec<(Arc<J>, JobHandle<()>)> = Vec::with_capacity(total);

        for job in jobs {
            let handle = self.pool.submit({
                let job = Arc::clone(&job);
                move |interrupt: &Interrupt| {
                    match panic::catch_unwind(AssertUnwindSafe(|| job.run(interrupt))) {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => warn!(job = job.name(), error = %err, "batch job failed"),
                        Err(payload) => error!(
                            job = job.name(),
                            panic = %panic_message(payload.as_ref()),
                            "batch job panicked"
                        ),
                    }
                    Ok(())
                }
            })?;

            handle.on_settled({
                let latch = Arc::clone(&latch);
                let completed = Arc::clone(&completed);
                let rejected = Arc::clone(&rejected);
                move |status| {
                    match status {
                        JobStatus::Completed | JobStatus::Failed => {
                            completed.fetch_add(1, Ordering::SeqCst);
                        }
                        JobStatus::Rejected => {
                            rejected.fetch_add(1, Ordering::SeqCst);
                        }
                        _ => {}
                    }
                    latch.count_down();
                }
            });
            submitted.push((job, handle));
        }

        let mut report = BatchReport {
            timeout: None,
            completed: 0,
            rejected: 0,
            remaining: Vec::new(),
        };

        if latch.wait_until(deadline) {
            report.completed = completed.load(Ordering::SeqCst);
            report.rejected = rejected.load(Ordering::SeqCst);
            debug!(pool = %self.pool.name(), total, rejected = report.rejected, "batch complete");
        } else {
            for (job, handle) in submitted {
                if handle.cancel(true) {
                    report.remaining.push(job);
                }
            }
            // a cancelled job can no longer complete, so the counts are final
            report.completed = completed.load(Ordering::SeqCst);
            report.rejected = rejected.load(Ordering::SeqCst);
            report.timeout = Some(BatchTimeout {
                timeout,
                completed: report.completed,
                total,
            });
            info!(
                pool = %self.pool.name(),
                completed = report.completed,
                remaining = report.remaining.len(),
                total,
                "batch timed out, cancelled remaining jobs"
            );
        }

        listener.on_complete(&report)?;
        Ok(report)
    }

    /// [`submit_for_complete`](Self::submit_for_complete) with [`FailOnTimeout`].
    pub fn submit_all<J>(
        &self,
        jobs: Vec<Arc<J>>,
        timeout: Duration,
    ) -> Result<BatchReport<J>, BatchError>
    where
        J: BatchJob + ?Sized,
    {
        self.submit_for_complete(jobs, timeout, &FailOnTimeout)
    }
}

impl BoundedScheduledPool {
    /// Submit a batch and wait for it. See [`BatchWaiter::submit_for_complete`].
    pub fn submit_for_complete<J, L>(
        &self,
        jobs: Vec<Arc<J>>,
        timeout: Duration,
        listener: &L,
    ) -> Result<BatchReport<J>, BatchError>
    where
        J: BatchJob + ?Sized,
        L: CompletionListener<J> + ?Sized,
    {
        BatchWaiter::new(self).submit_for_complete(jobs, timeout, listener)
    }
}
