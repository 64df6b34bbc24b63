//! Runner lifecycle: start/close state machine, master task, worker pool.
//!
//! Split into focused submodules:
//! - `core`: TaskRunner struct, constructor and accessors
//! - `lifecycle`: start and close transitions
//! - `task`: the injected master task, its context and hooks
//! - `types`: RunnerConfig and TaskState

mod core;
mod lifecycle;
mod task;
mod types;
#[cfg(test)]
mod tests;

pub use self::core::TaskRunner;
pub use self::task::{FnTask, NoopTask, RunnerContext, RunnerTask};
pub use self::types::{RunnerConfig, TaskState};
