use std::time::Duration;

use thiserror::Error;

use gantry_core::ConfigError;

use crate::rejection::RejectedError;

/// Errors returned by pool submission and construction.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error(transparent)]
    Rejected(#[from] RejectedError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Why a job did not produce a value.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("job was cancelled")]
    Cancelled,

    #[error("job was rejected by the pool")]
    Rejected,

    #[error("job panicked: {0}")]
    Panicked(String),

    #[error("job failed: {0:#}")]
    Failed(anyhow::Error),
}

/// Timeout report of a batch submitted with [`crate::BatchWaiter`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("batch timed out after {timeout:?}: {completed} of {total} jobs completed")]
pub struct BatchTimeout {
    pub timeout: Duration,
    pub completed: usize,
    pub total: usize,
}

#[derive(Error, Debug)]
pub enum BatchError {
    #[error(transparent)]
    Timeout(#[from] BatchTimeout),

    #[error("batch submission failed: {0}")]
    Submit(#[from] PoolError),
}

/// Errors from the runner lifecycle.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("failed to spawn master thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("master task failed: {0:#}")]
    Task(anyhow::Error),
}
