use std::fmt;
use std::sync::Arc;

use crate::error::RunnerError;
use crate::interrupt::Interrupt;
use crate::pool::BoundedScheduledPool;

/// What a [`TaskRunner`](super::TaskRunner) is for.
///
/// `run` is the master task. Depending on the startup mode it runs on the
/// thread calling `start()`, on a dedicated thread, or not at all. The hooks
/// bracket the lifecycle transitions and default to doing nothing.
pub trait RunnerTask: Send + Sync + 'static {
    fn run(&self, ctx: &RunnerContext) -> anyhow::Result<()>;

    /// Before the pool is built.
    fn on_starting(&self) {}

    /// After the master task was dispatched.
    fn on_started(&self) {}

    /// Before the pool is shut down.
    fn on_closing(&self) {}

    /// After the pool and master thread were released.
    fn on_closed(&self) {}
}

/// What the master task sees: the runner name, the worker pool (if one was
/// configured) and the interrupt raised by `close()`.
#[derive(Clone)]
pub struct RunnerContext {
    name: String,
    worker: Option<Arc<BoundedScheduledPool>>,
    interrupt: Interrupt,
}

impl RunnerContext {
    pub(crate) fn new(
        name: impl Into<String>,
        worker: Option<Arc<BoundedScheduledPool>>,
        interrupt: Interrupt,
    ) -> Self {
        Self { name: name.into(), worker, interrupt }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker(&self) -> Result<&Arc<BoundedScheduledPool>, RunnerError> {
        self.worker
            .as_ref()
            .ok_or_else(|| RunnerError::IllegalState(format!("runner '{}' has no worker pool", self.name)))
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_interrupted()
    }
}

impl fmt::Debug for RunnerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerContext")
            .field("name", &self.name)
            .field("has_worker", &self.worker.is_some())
            .field("interrupted", &self.interrupt.is_interrupted())
            .finish()
    }
}

/// [`RunnerTask`] backed by a closure.
pub struct FnTask<F>(pub F);

impl<F> RunnerTask for FnTask<F>
where
    F: Fn(&RunnerContext) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn run(&self, ctx: &RunnerContext) -> anyhow::Result<()> {
        (self.0)(ctx)
    }
}

/// Master task that returns immediately; for runners that only provide a pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTask;

impl RunnerTask for NoopTask {
    fn run(&self, _ctx: &RunnerContext) -> anyhow::Result<()> {
        Ok(())
    }
}
