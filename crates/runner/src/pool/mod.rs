//! Bounded scheduled worker pool.
//!
//! Split into focused submodules:
//! - `core`: shared state, worker loop, construction and shutdown
//! - `submit`: guarded submission entry points
//! - `task`: owned job state, schedules and jittered period sampling

mod core;
mod submit;
pub(crate) mod task;

pub use self::core::{BoundedScheduledPool, PoolBuilder};
pub use self::task::{random_period, Schedule};
