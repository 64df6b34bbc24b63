use std::sync::{Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::PoolError;
use crate::handle::JobStatus;
use crate::interrupt::Interrupt;
use crate::sync::{deadline_in, lock, saturating_add, wait, wait_timeout};

use super::core::Shared;

// ── Schedule ─────────────────────────────────────────────────────────

/// When a job first fires and how its next trigger time is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Run once after `delay`.
    OneShot { delay: Duration },
    /// Next trigger = previous trigger + `period`.
    FixedRate { initial_delay: Duration, period: Duration },
    /// Next trigger = completion time + `period`.
    FixedDelay { initial_delay: Duration, period: Duration },
    /// Next trigger = previous trigger + uniform[`min_period`, `max_period`).
    RandomRate {
        initial_delay: Duration,
        min_period: Duration,
        max_period: Duration,
    },
    /// Next trigger = completion time + uniform[`min_period`, `max_period`).
    RandomDelay {
        initial_delay: Duration,
        min_period: Duration,
        max_period: Duration,
    },
}

impl Schedule {
    pub fn initial_delay(&self) -> Duration {
        match *self {
            Schedule::OneShot { delay } => delay,
            Schedule::FixedRate { initial_delay, .. }
            | Schedule::FixedDelay { initial_delay, .. }
            | Schedule::RandomRate { initial_delay, .. }
            | Schedule::RandomDelay { initial_delay, .. } => initial_delay,
        }
    }

    pub fn is_periodic(&self) -> bool {
        !matches!(self, Schedule::OneShot { .. })
    }

    pub(crate) fn validate(&self) -> Result<(), PoolError> {
        match *self {
            Schedule::OneShot { .. } => Ok(()),
            Schedule::FixedRate { period, .. } | Schedule::FixedDelay { period, .. } => {
                if period.is_zero() {
                    return Err(PoolError::InvalidArgument("period must be > 0".into()));
                }
                Ok(())
            }
            Schedule::RandomRate { min_period, max_period, .. }
            | Schedule::RandomDelay { min_period, max_period, .. } => {
                if min_period.is_zero() {
                    return Err(PoolError::InvalidArgument("min_period must be > 0".into()));
                }
                if max_period < min_period {
                    return Err(PoolError::InvalidArgument(format!(
                        "max_period {max_period:?} is below min_period {min_period:?}"
                    )));
                }
                Ok(())
            }
        }
    }

    /// Trigger time of the run after one that was due at `scheduled` and
    /// finished at `finished`. `None` for one-shot jobs. Periods too large
    /// to add are pinned far in the future.
    pub fn next_trigger(&self, scheduled: Instant, finished: Instant) -> Option<Instant> {
        let next = match *self {
            Schedule::OneShot { .. } => return None,
            Schedule::FixedRate { period, .. } => saturating_add(scheduled, period),
            Schedule::FixedDelay { period, .. } => saturating_add(finished, period),
            Schedule::RandomRate { min_period, max_period, .. } => {
                saturating_add(scheduled, random_period(min_period, max_period))
            }
            Schedule::RandomDelay { min_period, max_period, .. } => {
                saturating_add(finished, random_period(min_period, max_period))
            }
        };
        Some(next)
    }
}

/// Uniform sample from `[min, max)`; `min` when the range is empty.
pub fn random_period(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let lo = u64::try_from(min.as_nanos()).unwrap_or(u64::MAX);
    let hi = u64::try_from(max.as_nanos()).unwrap_or(u64::MAX);
    if hi <= lo {
        return min;
    }
    Duration::from_nanos(rand::thread_rng().gen_range(lo..hi))
}

// ── Job body ─────────────────────────────────────────────────────────

pub(crate) type OnceFn = Box<dyn FnOnce(&Interrupt) -> anyhow::Result<()> + Send>;
pub(crate) type RepeatFn = Box<dyn FnMut(&Interrupt) -> anyhow::Result<()> + Send>;

pub(crate) enum Body {
    Once(OnceFn),
    Repeat(RepeatFn),
}

impl Body {
    /// Run the body. Repeating bodies are handed back for the next run.
    pub(crate) fn call(self, interrupt: &Interrupt) -> (anyhow::Result<()>, Option<Body>) {
        match self {
            Body::Once(f) => (f(interrupt), None),
            Body::Repeat(mut f) => {
                let result = f(interrupt);
                (result, Some(Body::Repeat(f)))
            }
        }
    }
}

/// Called once with the terminal status when a job settles.
pub(crate) type SettleHook = Box<dyn FnOnce(JobStatus) + Send>;

pub(crate) enum JobFailure {
    Error(anyhow::Error),
    Panic(String),
}

// ── TaskCore ─────────────────────────────────────────────────────────

/// Owned state of one scheduled job: its body, schedule, status and the
/// sequence number assigned at submission.
pub(crate) struct TaskCore {
    seq: u64,
    schedule: Schedule,
    body: Mutex<Option<Body>>,
    status: Mutex<JobStatus>,
    settled: Condvar,
    settle_hook: Mutex<Option<SettleHook>>,
    failure: Mutex<Option<JobFailure>>,
    interrupt: Interrupt,
    owner: Weak<Shared>,
}

impl TaskCore {
    pub(crate) fn new(seq: u64, schedule: Schedule, body: Body, owner: Weak<Shared>) -> Self {
        Self {
            seq,
            schedule,
            body: Mutex::new(Some(body)),
            status: Mutex::new(JobStatus::Pending),
            settled: Condvar::new(),
            settle_hook: Mutex::new(None),
            failure: Mutex::new(None),
            interrupt: Interrupt::new(),
            owner,
        }
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    pub(crate) fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub(crate) fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    pub(crate) fn status(&self) -> JobStatus {
        *lock(&self.status)
    }

    fn transition(&self, from: &[JobStatus], to: JobStatus) -> Option<JobStatus> {
        let mut status = lock(&self.status);
        let prev = *status;
        if !from.contains(&prev) {
            return None;
        }
        *status = to;
        let hook = if to.is_terminal() {
            self.settled.notify_all();
            lock(&self.settle_hook).take()
        } else {
            None
        };
        drop(status);
        if let Some(hook) = hook {
            hook(to);
        }
        Some(prev)
    }

    /// Register `hook` to run when the job settles, however it settles.
    /// Runs at once on this thread if the job has already settled.
    pub(crate) fn on_settled(&self, hook: SettleHook) {
        let status = lock(&self.status);
        if !status.is_terminal() {
            *lock(&self.settle_hook) = Some(hook);
            return;
        }
        let settled = *status;
        drop(status);
        hook(settled);
    }

    /// Pending -> Running. False if the job was cancelled meanwhile.
    pub(crate) fn begin(&self) -> bool {
        self.transition(&[JobStatus::Pending], JobStatus::Running).is_some()
    }

    /// Running -> Pending after a periodic run.
    pub(crate) fn rearm(&self) -> bool {
        self.transition(&[JobStatus::Running], JobStatus::Pending).is_some()
    }

    pub(crate) fn complete(&self) {
        self.transition(&[JobStatus::Running], JobStatus::Completed);
    }

    pub(crate) fn fail(&self, failure: JobFailure) {
        // held across the transition so a woken waiter always sees the failure
        let mut slot = lock(&self.failure);
        if self.transition(&[JobStatus::Running], JobStatus::Failed).is_some() {
            *slot = Some(failure);
        }
    }

    /// Settle a job that never made it into the queue.
    pub(crate) fn settle_rejected(&self) {
        if self.transition(&[JobStatus::Pending], JobStatus::Rejected).is_some() {
            drop(self.take_body());
        }
    }

    /// Mark the job cancelled without touching the pool queue.
    pub(crate) fn cancel_status(&self, may_interrupt: bool) -> bool {
        let Some(prev) =
            self.transition(&[JobStatus::Pending, JobStatus::Running], JobStatus::Cancelled)
        else {
            return false;
        };
        match prev {
            JobStatus::Running if may_interrupt => self.interrupt.raise(),
            JobStatus::Pending => drop(self.take_body()),
            _ => {}
        }
        true
    }

    /// Cancel and remove from the owning pool's queue.
    pub(crate) fn cancel(&self, may_interrupt: bool) -> bool {
        if !self.cancel_status(may_interrupt) {
            return false;
        }
        if let Some(shared) = self.owner.upgrade() {
            shared.remove(self.seq);
            shared.metrics.record_cancelled(1);
        }
        true
    }

    pub(crate) fn take_body(&self) -> Option<Body> {
        lock(&self.body).take()
    }

    pub(crate) fn restore_body(&self, body: Body) {
        *lock(&self.body) = Some(body);
    }

    pub(crate) fn take_failure(&self) -> Option<JobFailure> {
        lock(&self.failure).take()
    }

    /// Wait until the status is terminal (or the timeout elapses) and return it.
    /// A timeout too large to represent waits without a deadline.
    pub(crate) fn wait_settled(&self, timeout: Option<Duration>) -> JobStatus {
        let deadline = timeout.and_then(deadline_in);
        let mut status = lock(&self.status);
        loop {
            if status.is_terminal() {
                return *status;
            }
            match deadline {
                None => status = wait(&self.settled, status),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return *status;
                    }
                    status = wait_timeout(&self.settled, status, deadline - now);
                }
            }
        }
    }
}
