//! Bounded task runner for the gateway utility layer.
//!
//! - [`TaskRunner`] owns the start/close lifecycle, an optional master task
//!   and an optional worker pool.
//! - [`BoundedScheduledPool`] runs one-shot, fixed and jittered periodic jobs
//!   on a fixed set of threads and rejects work beyond its accept queue.
//! - [`BatchWaiter`] submits a batch of jobs and waits for them with a
//!   timeout, cancelling stragglers.

pub mod batch;
pub mod error;
pub mod handle;
pub mod interrupt;
pub mod metrics;
pub mod pool;
pub mod rejection;
pub mod runner;
mod sync;

pub use batch::{
    BatchJob, BatchReport, BatchWaiter, CompletionListener, FailOnTimeout, FnJob, LogOnTimeout,
};
pub use error::{BatchError, BatchTimeout, JobError, PoolError, RunnerError};
pub use handle::{JobHandle, JobStatus};
pub use interrupt::Interrupt;
pub use metrics::PoolMetrics;
pub use pool::{random_period, BoundedScheduledPool, PoolBuilder, Schedule};
pub use rejection::{
    AbortPolicy, CallerRunsPolicy, DiscardOldestPolicy, DiscardPolicy, RejectReason, RejectedError,
    RejectedJob, RejectionPolicy,
};
pub use runner::{
    FnTask, NoopTask, RunnerConfig, RunnerContext, RunnerTask, TaskRunner, TaskState,
};

pub use gantry_core::{ConfigError, RejectionKind, RunnerProperties, StartupMode};
