use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use gantry_core::StartupMode;
use tracing::{debug, error, info, warn};

use crate::error::RunnerError;
use crate::interrupt::Interrupt;
use crate::pool::BoundedScheduledPool;
use crate::sync::{lock, panic_message, write};

use super::core::{MasterThread, TaskRunner};
use super::task::{RunnerContext, RunnerTask};

impl<T: RunnerTask> TaskRunner<T> {
    /// Start the runner: build the pool (if configured) and dispatch the
    /// master task according to the startup mode.
    ///
    /// A second call logs a warning and does nothing. In Sync mode this
    /// blocks for the duration of the master task and returns its error.
    pub fn start(&self) -> Result<(), RunnerError> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(runner = %self.name, "runner already started, ignoring start()");
            return Ok(());
        }

        let props = self.config.properties();
        info!(runner = %self.name, mode = %props.startup_mode, "starting runner");
        props.log_summary(&self.name);
        self.hook("on_starting", || self.task.on_starting());

        let worker = if props.has_pool() {
            Some(Arc::new(self.build_pool()?))
        } else {
            None
        };
        *write(&self.worker) = worker.clone();

        let interrupt = Interrupt::new();
        let ctx = RunnerContext::new(self.name.clone(), worker, interrupt.clone());
        let dispatched = self.dispatch_master(props.startup_mode, ctx, interrupt);

        if self.release_if_closed() {
            return dispatched;
        }
        dispatched?;

        self.hook("on_started", || self.task.on_started());
        info!(runner = %self.name, "runner started");
        Ok(())
    }

    fn dispatch_master(
        &self,
        mode: StartupMode,
        ctx: RunnerContext,
        interrupt: Interrupt,
    ) -> Result<(), RunnerError> {
        match mode {
            StartupMode::Sync => {
                *lock(&self.master) = Some(MasterThread { handle: None, interrupt });
                debug!(runner = %self.name, "running master task on caller thread");
                let result = self.run_sync(&ctx);
                // the caller thread is the master only while the task runs
                lock(&self.master).take();
                result
            }
            StartupMode::Async => {
                let task = Arc::clone(&self.task);
                let handle = thread::Builder::new()
                    .name(format!("{}-master", self.thread_prefix()))
                    .spawn(move || run_master(task.as_ref(), &ctx))?;
                *lock(&self.master) = Some(MasterThread { handle: Some(handle), interrupt });
                debug!(runner = %self.name, "master thread spawned");
                Ok(())
            }
            StartupMode::NoStartup => {
                debug!(runner = %self.name, "no master task");
                Ok(())
            }
        }
    }

    /// Tear down what `start()` stored if `close()` ran before it finished.
    /// Returns `true` when the runner is already closed.
    fn release_if_closed(&self) -> bool {
        if !self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let worker = write(&self.worker).take();
        let master = lock(&self.master).take();
        if worker.is_some() || master.is_some() {
            warn!(runner = %self.name, "runner closed while starting, releasing pool and master");
        }
        if let Some(pool) = worker {
            self.shutdown_pool(&pool);
        }
        if let Some(master) = master {
            master.interrupt.raise();
        }
        true
    }

    /// Close the runner: shut the pool down (forcing it after the shutdown
    /// timeout) and interrupt the master task.
    ///
    /// Never fails; failures are logged. Does nothing if the runner was
    /// never started or is already closed.
    pub fn close(&self) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        info!(runner = %self.name, "closing runner");
        self.hook("on_closing", || self.task.on_closing());

        let worker = write(&self.worker).take();
        if let Some(pool) = worker {
            self.shutdown_pool(&pool);
        }

        let master = lock(&self.master).take();
        if let Some(master) = master {
            master.interrupt.raise();
            // the master thread is detached, it observes the interrupt on its own
            drop(master.handle);
        }

        self.hook("on_closed", || self.task.on_closed());
        info!(runner = %self.name, "runner closed");
    }

    fn build_pool(&self) -> Result<BoundedScheduledPool, RunnerError> {
        let props = self.config.properties();
        let pool = BoundedScheduledPool::builder(self.name.clone())
            .threads(props.pool_size())
            .keep_alive(props.keep_alive())
            .accept_queue_size(props.accept_queue_limit())
            .rejection_policy(Arc::clone(self.config.rejection_policy()))
            .thread_name_prefix(self.thread_prefix())
            .build()?;
        Ok(pool)
    }

    fn run_sync(&self, ctx: &RunnerContext) -> Result<(), RunnerError> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.task.run(ctx))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                error!(runner = %self.name, error = %err, "master task failed");
                Err(RunnerError::Task(err))
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                error!(runner = %self.name, panic = %msg, "master task panicked");
                Err(RunnerError::Task(anyhow::anyhow!("master task panicked: {msg}")))
            }
        }
    }

    fn shutdown_pool(&self, pool: &BoundedScheduledPool) {
        let timeout = self.config.properties().shutdown_timeout();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            pool.shutdown();
            if pool.await_termination(timeout) {
                return;
            }
            let drained = pool.shutdown_now();
            warn!(
                runner = %self.name,
                timeout_ms = timeout.as_millis() as u64,
                drained,
                "pool did not terminate in time, forced shutdown"
            );
        }));
        if let Err(payload) = result {
            error!(
                runner = %self.name,
                panic = %panic_message(payload.as_ref()),
                "pool shutdown failed"
            );
        }
    }

    /// Run a lifecycle hook, logging instead of propagating a panic.
    fn hook(&self, name: &str, f: impl FnOnce()) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
            error!(
                runner = %self.name,
                hook = name,
                panic = %panic_message(payload.as_ref()),
                "lifecycle hook panicked"
            );
        }
    }
}

/// Body of the Async master thread.
fn run_master<T: RunnerTask + ?Sized>(task: &T, ctx: &RunnerContext) {
    debug!(runner = %ctx.name(), "master task running");
    match panic::catch_unwind(AssertUnwindSafe(|| task.run(ctx))) {
        Ok(Ok(())) => debug!(runner = %ctx.name(), "master task finished"),
        Ok(Err(err)) => error!(runner = %ctx.name(), error = %err, "master task failed"),
        Err(payload) => error!(
            runner = %ctx.name(),
            panic = %panic_message(payload.as_ref()),
            "master task panicked"
        ),
    }
}
