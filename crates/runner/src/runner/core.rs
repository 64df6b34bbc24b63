use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use crate::error::RunnerError;
use crate::interrupt::Interrupt;
use crate::pool::BoundedScheduledPool;
use crate::sync::{lock, read};

use super::task::RunnerTask;
use super::types::{RunnerConfig, TaskState};

/// The thread the master task runs on. `handle` is `None` in Sync mode,
/// where the thread that called `start()` is the master until the task
/// returns.
pub(super) struct MasterThread {
    pub(super) handle: Option<JoinHandle<()>>,
    pub(super) interrupt: Interrupt,
}

/// Owns a master task and an optional bounded worker pool, and moves them
/// through `Idle -> Running -> Closed` exactly once.
///
/// `start()` and `close()` are idempotent; both are guarded by a
/// compare-and-swap so concurrent callers cannot create a second pool or
/// master thread, or shut them down twice. Dropping the runner closes it.
pub struct TaskRunner<T: RunnerTask> {
    pub(super) name: String,
    pub(super) config: RunnerConfig,
    pub(super) task: Arc<T>,
    pub(super) started: AtomicBool,
    pub(super) closed: AtomicBool,
    pub(super) worker: RwLock<Option<Arc<BoundedScheduledPool>>>,
    pub(super) master: Mutex<Option<MasterThread>>,
}

impl<T: RunnerTask> TaskRunner<T> {
    pub fn new(name: impl Into<String>, config: RunnerConfig, task: T) -> Self {
        Self {
            name: name.into(),
            config,
            task: Arc::new(task),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            worker: RwLock::new(None),
            master: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn task(&self) -> &T {
        &self.task
    }

    pub fn state(&self) -> TaskState {
        if self.closed.load(Ordering::SeqCst) {
            TaskState::Closed
        } else if self.started.load(Ordering::SeqCst) {
            TaskState::Running
        } else {
            TaskState::Idle
        }
    }

    pub fn is_started(&self) -> bool {
        self.state() == TaskState::Running
    }

    /// Running with a live master whose interrupt has not been raised.
    pub fn is_active(&self) -> bool {
        let master_alive = lock(&self.master)
            .as_ref()
            .is_some_and(|m| !m.interrupt.is_interrupted());
        master_alive && self.is_started()
    }

    /// The worker pool. Fails when no pool was configured or the runner is
    /// not running.
    pub fn worker(&self) -> Result<Arc<BoundedScheduledPool>, RunnerError> {
        read(&self.worker).clone().ok_or_else(|| {
            RunnerError::IllegalState(format!(
                "runner '{}' has no worker pool (state: {}, concurrency: {})",
                self.name,
                self.state(),
                self.config.properties().concurrency
            ))
        })
    }

    /// Prefix for worker and master thread names.
    pub(super) fn thread_prefix(&self) -> String {
        self.config
            .properties()
            .thread_name_prefix
            .clone()
            .unwrap_or_else(|| self.name.clone())
    }
}

impl<T: RunnerTask> Drop for TaskRunner<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T: RunnerTask> fmt::Debug for TaskRunner<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRunner")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}
