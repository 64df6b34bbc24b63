//! Cooperative interruption for jobs and master tasks.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::sync::{deadline_in, lock, wait, wait_timeout};

/// A raise-once flag a running job polls (or sleeps on) to notice that it
/// should stop. Cloning shares the same flag.
#[derive(Clone, Default)]
pub struct Interrupt {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    raised: AtomicBool,
    gate: Mutex<()>,
    cond: Condvar,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake every thread sleeping on it.
    pub fn raise(&self) {
        let _guard = lock(&self.inner.gate);
        self.inner.raised.store(true, Ordering::SeqCst);
        self.inner.cond.notify_all();
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless interrupted first.
    ///
    /// Returns `true` if the full duration elapsed, `false` on interrupt.
    /// A duration too large to represent sleeps until interrupted.
    pub fn sleep(&self, duration: Duration) -> bool {
        let Some(deadline) = deadline_in(duration) else {
            self.wait();
            return false;
        };
        let mut guard = lock(&self.inner.gate);
        loop {
            if self.is_interrupted() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            guard = wait_timeout(&self.inner.cond, guard, deadline - now);
        }
    }

    /// Block until the flag is raised.
    pub fn wait(&self) {
        let mut guard = lock(&self.inner.gate);
        while !self.is_interrupted() {
            guard = wait(&self.inner.cond, guard);
        }
    }
}

impl fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interrupt")
            .field("raised", &self.is_interrupted())
            .finish()
    }
}
