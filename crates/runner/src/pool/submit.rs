use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::PoolError;
use crate::handle::JobHandle;
use crate::interrupt::Interrupt;
use crate::rejection::{RejectReason, RejectedError, RejectedJob};
use crate::sync::{lock, saturating_add};

use super::core::{BoundedScheduledPool, RunState};
use super::task::{Body, Schedule, TaskCore};

impl BoundedScheduledPool {
    /// Run `job` as soon as a worker is free, without a handle.
    pub fn execute<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce(&Interrupt) -> anyhow::Result<()> + Send + 'static,
    {
        self.submit(job).map(|_| ())
    }

    /// Run `job` as soon as a worker is free and hand back its result.
    pub fn submit<T, F>(&self, job: F) -> Result<JobHandle<T>, PoolError>
    where
        T: Send + 'static,
        F: FnOnce(&Interrupt) -> anyhow::Result<T> + Send + 'static,
    {
        self.schedule(Duration::ZERO, job)
    }

    /// Run `job` once after `delay`.
    pub fn schedule<T, F>(&self, delay: Duration, job: F) -> Result<JobHandle<T>, PoolError>
    where
        T: Send + 'static,
        F: FnOnce(&Interrupt) -> anyhow::Result<T> + Send + 'static,
    {
        let value = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&value);
        let body = Body::Once(Box::new(move |interrupt: &Interrupt| -> anyhow::Result<()> {
            let v = job(interrupt)?;
            *lock(&slot) = Some(v);
            Ok(())
        }));
        let task = self.admit(Schedule::OneShot { delay }, body)?;
        Ok(JobHandle::new(task, value))
    }

    /// Run `job` every `period`, measured between trigger times.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        initial_delay: Duration,
        period: Duration,
        job: F,
    ) -> Result<JobHandle<()>, PoolError>
    where
        F: FnMut(&Interrupt) -> anyhow::Result<()> + Send + 'static,
    {
        self.schedule_with(Schedule::FixedRate { initial_delay, period }, job)
    }

    /// Run `job` repeatedly, waiting `period` after each run finishes.
    pub fn schedule_with_fixed_delay<F>(
        &self,
        initial_delay: Duration,
        period: Duration,
        job: F,
    ) -> Result<JobHandle<()>, PoolError>
    where
        F: FnMut(&Interrupt) -> anyhow::Result<()> + Send + 'static,
    {
        self.schedule_with(Schedule::FixedDelay { initial_delay, period }, job)
    }

    /// Run `job` repeatedly; each gap between trigger times is drawn from
    /// `[min_period, max_period)`.
    pub fn schedule_at_random_rate<F>(
        &self,
        initial_delay: Duration,
        min_period: Duration,
        max_period: Duration,
        job: F,
    ) -> Result<JobHandle<()>, PoolError>
    where
        F: FnMut(&Interrupt) -> anyhow::Result<()> + Send + 'static,
    {
        self.schedule_with(
            Schedule::RandomRate { initial_delay, min_period, max_period },
            job,
        )
    }

    /// Run `job` repeatedly; after each run the pause is drawn from
    /// `[min_period, max_period)`.
    pub fn schedule_with_random_delay<F>(
        &self,
        initial_delay: Duration,
        min_period: Duration,
        max_period: Duration,
        job: F,
    ) -> Result<JobHandle<()>, PoolError>
    where
        F: FnMut(&Interrupt) -> anyhow::Result<()> + Send + 'static,
    {
        self.schedule_with(
            Schedule::RandomDelay { initial_delay, min_period, max_period },
            job,
        )
    }

    /// Schedule `job` according to an explicit [`Schedule`].
    pub fn schedule_with<F>(&self, schedule: Schedule, job: F) -> Result<JobHandle<()>, PoolError>
    where
        F: FnMut(&Interrupt) -> anyhow::Result<()> + Send + 'static,
    {
        let task = self.admit(schedule, Body::Repeat(Box::new(job)))?;
        Ok(JobHandle::new(task, Arc::new(Mutex::new(Some(())))))
    }

    fn admit(&self, schedule: Schedule, body: Body) -> Result<Arc<TaskCore>, PoolError> {
        schedule.validate()?;
        let task = Arc::new(TaskCore::new(
            self.shared.next_seq(),
            schedule,
            body,
            Arc::downgrade(&self.shared),
        ));
        self.offer(Arc::clone(&task), schedule.initial_delay())?;
        Ok(task)
    }

    /// Queue `task` if the accept queue has room, otherwise hand it to the
    /// rejection policy on this thread.
    pub(crate) fn offer(&self, task: Arc<TaskCore>, delay: Duration) -> Result<(), RejectedError> {
        let reason = {
            let mut state = lock(&self.shared.state);
            if state.run_state != RunState::Running {
                RejectReason::Shutdown
            } else if state.has_room(self.shared.accept_queue_size) {
                self.shared.push_locked(&mut state, task, saturating_add(Instant::now(), delay));
                drop(state);
                self.shared.metrics.record_submitted();
                return Ok(());
            } else {
                RejectReason::QueueFull {
                    queued: state.queue.len(),
                    limit: self.shared.accept_queue_size,
                }
            }
        };

        self.shared.metrics.record_rejected();
        warn!(
            pool = %self.shared.name,
            job = task.seq(),
            policy = self.rejection.name(),
            %reason,
            "job rejected"
        );
        let policy = Arc::clone(&self.rejection);
        policy.rejected(RejectedJob::new(task, delay, reason), self)
    }
}
