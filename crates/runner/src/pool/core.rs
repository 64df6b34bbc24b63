use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::error::PoolError;
use crate::metrics::{MetricsRecorder, PoolMetrics};
use crate::rejection::{AbortPolicy, RejectionPolicy};
use crate::sync::{deadline_in, lock, panic_message, wait, wait_timeout};

use super::task::{JobFailure, TaskCore};

// ── Queue entries ────────────────────────────────────────────────────

/// A queued job and the instant it becomes due.
///
/// Ordered so the max-heap `BinaryHeap` pops the earliest trigger first,
/// and the lowest sequence number among equal triggers.
pub(crate) struct Entry {
    pub(crate) trigger: Instant,
    pub(crate) task: Arc<TaskCore>,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .trigger
            .cmp(&self.trigger)
            .then_with(|| other.task.seq().cmp(&self.task.seq()))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.trigger == other.trigger && self.task.seq() == other.task.seq()
    }
}

impl Eq for Entry {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum RunState {
    Running,
    /// No new jobs; queued one-shot jobs still run.
    Shutdown,
    /// No new jobs; queue drained, running jobs interrupted.
    Stop,
    Terminated,
}

pub(crate) struct PoolState {
    pub(crate) queue: BinaryHeap<Entry>,
    /// Jobs currently executing on workers, by sequence number.
    pub(crate) running: HashMap<u64, Arc<TaskCore>>,
    pub(crate) run_state: RunState,
    pub(crate) live_workers: usize,
}

impl PoolState {
    fn idle_workers(&self) -> usize {
        self.live_workers.saturating_sub(self.running.len())
    }

    /// Whether one more job fits: an idle worker takes a job straight away,
    /// so only the remainder counts against the accept queue.
    pub(crate) fn has_room(&self, accept_queue_size: usize) -> bool {
        self.queue.len() < accept_queue_size + self.idle_workers()
    }
}

// ── Shared state ─────────────────────────────────────────────────────

pub(crate) struct Shared {
    pub(crate) name: String,
    pub(crate) state: Mutex<PoolState>,
    /// Signalled when the queue head changes or the run state moves on.
    pub(crate) available: Condvar,
    pub(crate) terminated: Condvar,
    sequence: AtomicU64,
    pub(crate) metrics: MetricsRecorder,
    pub(crate) pool_size: usize,
    pub(crate) keep_alive: Duration,
    pub(crate) accept_queue_size: usize,
}

impl Shared {
    pub(crate) fn next_seq(&self) -> u64 {
        self.sequence.fetch_add(1, AtomicOrdering::SeqCst)
    }

    pub(crate) fn push_locked(&self, state: &mut PoolState, task: Arc<TaskCore>, trigger: Instant) {
        state.queue.push(Entry { trigger, task });
        self.available.notify_one();
    }

    /// Drop a job from the queue (cancellation).
    pub(crate) fn remove(&self, seq: u64) {
        let mut state = lock(&self.state);
        let before = state.queue.len();
        state.queue.retain(|e| e.task.seq() != seq);
        if state.queue.len() != before {
            debug!(pool = %self.name, job = seq, "removed cancelled job from queue");
            self.available.notify_all();
        }
    }

    fn worker_loop(self: Arc<Self>, worker: usize) {
        debug!(pool = %self.name, worker, "worker started");
        while let Some(entry) = self.next_entry() {
            let next = self.run_task(&entry.task, entry.trigger);
            self.finish_run(entry.task, next);
        }
        self.worker_exit(worker);
    }

    /// Block until a job is due or the pool winds down.
    fn next_entry(&self) -> Option<Entry> {
        let mut state = lock(&self.state);
        loop {
            match state.run_state {
                RunState::Stop | RunState::Terminated => return None,
                RunState::Shutdown if state.queue.is_empty() => return None,
                _ => {}
            }

            let now = Instant::now();
            match state.queue.peek().map(|e| e.trigger) {
                Some(trigger) if trigger <= now => {
                    if let Some(entry) = state.queue.pop() {
                        state.running.insert(entry.task.seq(), Arc::clone(&entry.task));
                        if state.run_state != RunState::Running && state.queue.is_empty() {
                            self.available.notify_all();
                        }
                        return Some(entry);
                    }
                }
                Some(trigger) => state = wait_timeout(&self.available, state, trigger - now),
                None => state = wait(&self.available, state),
            }
        }
    }

    /// Execute one run of a job. Returns the next trigger when a periodic
    /// job should run again.
    pub(crate) fn run_task(&self, task: &Arc<TaskCore>, scheduled: Instant) -> Option<Instant> {
        if !task.begin() {
            return None;
        }
        let Some(body) = task.take_body() else {
            task.complete();
            return None;
        };

        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body.call(task.interrupt())));
        let finished = Instant::now();
        let elapsed = finished - started;

        match outcome {
            Ok((Ok(()), body)) => {
                self.metrics.record_execution(elapsed, true);
                match body {
                    Some(body) if task.schedule().is_periodic() => {
                        task.restore_body(body);
                        if task.rearm() {
                            return task.schedule().next_trigger(scheduled, finished);
                        }
                        drop(task.take_body());
                        None
                    }
                    _ => {
                        task.complete();
                        None
                    }
                }
            }
            Ok((Err(err), _)) => {
                self.metrics.record_execution(elapsed, false);
                warn!(pool = %self.name, job = task.seq(), error = %err, "job failed");
                task.fail(JobFailure::Error(err));
                None
            }
            Err(payload) => {
                self.metrics.record_execution(elapsed, false);
                let msg = panic_message(payload.as_ref());
                error!(pool = %self.name, job = task.seq(), panic = %msg, "job panicked");
                task.fail(JobFailure::Panic(msg));
                None
            }
        }
    }

    /// Bookkeeping after a run: requeue periodic jobs while the pool runs,
    /// cancel them once it is shutting down.
    pub(crate) fn finish_run(&self, task: Arc<TaskCore>, next: Option<Instant>) {
        let mut state = lock(&self.state);
        state.running.remove(&task.seq());
        let Some(next) = next else {
            return;
        };
        if state.run_state == RunState::Running {
            self.push_locked(&mut state, task, next);
            return;
        }
        drop(state);
        if task.cancel_status(false) {
            self.metrics.record_cancelled(1);
        }
    }

    fn worker_exit(&self, worker: usize) {
        let mut state = lock(&self.state);
        state.live_workers = state.live_workers.saturating_sub(1);
        debug!(pool = %self.name, worker, "worker exiting");
        if state.live_workers == 0 && state.run_state != RunState::Running {
            state.run_state = RunState::Terminated;
            self.terminated.notify_all();
            info!(pool = %self.name, "pool terminated");
        }
    }
}

// ── BoundedScheduledPool ─────────────────────────────────────────────

/// Fixed-size scheduled worker pool with a bounded accept queue.
///
/// Jobs are ordered by trigger time, ties broken by submission order.
/// When the accept queue is full the configured [`RejectionPolicy`] decides
/// what happens to the job; the submitter gets back a settled handle instead
/// of a panic or an unbounded queue.
pub struct BoundedScheduledPool {
    pub(crate) shared: Arc<Shared>,
    pub(crate) rejection: Arc<dyn RejectionPolicy>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BoundedScheduledPool {
    pub fn builder(name: impl Into<String>) -> PoolBuilder {
        PoolBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn pool_size(&self) -> usize {
        self.shared.pool_size
    }

    pub fn keep_alive(&self) -> Duration {
        self.shared.keep_alive
    }

    pub fn accept_queue_size(&self) -> usize {
        self.shared.accept_queue_size
    }

    /// Jobs waiting in the queue, periodic jobs between runs included.
    pub fn queued(&self) -> usize {
        lock(&self.shared.state).queue.len()
    }

    /// Jobs currently executing on workers.
    pub fn active(&self) -> usize {
        lock(&self.shared.state).running.len()
    }

    pub fn metrics(&self) -> PoolMetrics {
        let (queued, active) = {
            let state = lock(&self.shared.state);
            (state.queue.len(), state.running.len())
        };
        self.shared.metrics.snapshot(self.shared.pool_size, queued, active)
    }

    pub fn is_shutdown(&self) -> bool {
        lock(&self.shared.state).run_state != RunState::Running
    }

    pub fn is_terminated(&self) -> bool {
        lock(&self.shared.state).run_state == RunState::Terminated
    }

    /// Remove the queued one-shot job with the earliest trigger and settle it
    /// as rejected. Periodic jobs waiting between runs are never evicted.
    /// Returns `false` when no one-shot job is queued.
    pub fn remove_oldest(&self) -> bool {
        let entry = {
            let mut state = lock(&self.shared.state);
            let mut entries = std::mem::take(&mut state.queue).into_vec();
            // entries order reversed, so the earliest trigger is the max
            let oldest = entries
                .iter()
                .enumerate()
                .filter(|(_, e)| !e.task.schedule().is_periodic())
                .max_by(|(_, a), (_, b)| a.cmp(b))
                .map(|(i, _)| i);
            let entry = oldest.map(|i| entries.swap_remove(i));
            state.queue = BinaryHeap::from(entries);
            entry
        };
        match entry {
            Some(entry) => {
                debug!(pool = %self.shared.name, job = entry.task.seq(), "discarding oldest job");
                entry.task.settle_rejected();
                true
            }
            None => false,
        }
    }

    /// Stop accepting jobs. Periodic jobs are cancelled and removed; queued
    /// one-shot jobs still run. Does not block.
    pub fn shutdown(&self) {
        let periodic = {
            let mut state = lock(&self.shared.state);
            if state.run_state != RunState::Running {
                return;
            }
            state.run_state = RunState::Shutdown;
            let (periodic, keep): (Vec<Entry>, Vec<Entry>) = std::mem::take(&mut state.queue)
                .into_vec()
                .into_iter()
                .partition(|e| e.task.schedule().is_periodic());
            state.queue = BinaryHeap::from(keep);
            if state.live_workers == 0 {
                state.run_state = RunState::Terminated;
                self.shared.terminated.notify_all();
            }
            self.shared.available.notify_all();
            periodic
        };

        let cancelled = periodic
            .iter()
            .filter(|e| e.task.cancel_status(false))
            .count();
        self.shared.metrics.record_cancelled(cancelled);
        info!(pool = %self.shared.name, cancelled, "pool shutting down");
    }

    /// Stop accepting jobs, cancel everything queued and raise the interrupt
    /// of every running job. Returns the number of jobs drained from the queue.
    pub fn shutdown_now(&self) -> usize {
        let (drained, running) = {
            let mut state = lock(&self.shared.state);
            if state.run_state < RunState::Stop {
                state.run_state = RunState::Stop;
            }
            let drained = std::mem::take(&mut state.queue).into_vec();
            let running: Vec<Arc<TaskCore>> = state.running.values().cloned().collect();
            if state.live_workers == 0 {
                state.run_state = RunState::Terminated;
                self.shared.terminated.notify_all();
            }
            self.shared.available.notify_all();
            (drained, running)
        };

        for task in &running {
            task.interrupt().raise();
        }
        let cancelled = drained
            .iter()
            .filter(|e| e.task.cancel_status(false))
            .count();
        self.shared.metrics.record_cancelled(cancelled);
        warn!(
            pool = %self.shared.name,
            drained = drained.len(),
            interrupted = running.len(),
            "pool stopped"
        );
        drained.len()
    }

    /// Block until every worker has exited after a shutdown, or the timeout
    /// elapses. Returns `true` if the pool terminated.
    /// A timeout too large to represent waits without a deadline.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = deadline_in(timeout);
        {
            let mut state = lock(&self.shared.state);
            while state.run_state != RunState::Terminated {
                let Some(deadline) = deadline else {
                    state = wait(&self.shared.terminated, state);
                    continue;
                };
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                state = wait_timeout(&self.shared.terminated, state, deadline - now);
            }
        }
        self.join_workers();
        true
    }

    fn join_workers(&self) {
        let handles = std::mem::take(&mut *lock(&self.workers));
        for handle in handles {
            if handle.join().is_err() {
                error!(pool = %self.shared.name, "worker thread panicked");
            }
        }
    }

    /// Run a job on the calling thread (caller-runs rejection).
    pub(crate) fn run_inline(&self, task: Arc<TaskCore>) {
        let next = self.shared.run_task(&task, Instant::now());
        self.shared.finish_run(task, next);
    }
}

impl Drop for BoundedScheduledPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for BoundedScheduledPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedScheduledPool")
            .field("name", &self.shared.name)
            .field("pool_size", &self.shared.pool_size)
            .field("accept_queue_size", &self.shared.accept_queue_size)
            .field("rejection", &self.rejection.name())
            .finish()
    }
}

// ── PoolBuilder ──────────────────────────────────────────────────────

/// Fluent builder for a [`BoundedScheduledPool`].
///
/// # Example
/// ```ignore
/// let pool = BoundedScheduledPool::builder("gateway")
///     .threads(4)
///     .accept_queue_size(64)
///     .rejection_policy(Arc::new(CallerRunsPolicy))
///     .build()?;
/// ```
pub struct PoolBuilder {
    name: String,
    threads: usize,
    keep_alive: Duration,
    accept_queue_size: usize,
    rejection: Arc<dyn RejectionPolicy>,
    thread_name_prefix: Option<String>,
}

impl PoolBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            threads: 1,
            keep_alive: Duration::ZERO,
            accept_queue_size: 1,
            rejection: Arc::new(AbortPolicy),
            thread_name_prefix: None,
        }
    }

    /// Number of worker threads (default: 1).
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Idle keep-alive of worker threads. Workers are never retired because
    /// core size equals max size; the value is carried for introspection.
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Maximum queued jobs before rejection (default: 1).
    pub fn accept_queue_size(mut self, accept_queue_size: usize) -> Self {
        self.accept_queue_size = accept_queue_size;
        self
    }

    pub fn rejection_policy(mut self, policy: Arc<dyn RejectionPolicy>) -> Self {
        self.rejection = policy;
        self
    }

    /// Worker threads are named `{prefix}-{n}` (default prefix: pool name).
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = Some(prefix.into());
        self
    }

    /// Spawn the workers and return the running pool.
    pub fn build(self) -> Result<BoundedScheduledPool, PoolError> {
        if self.threads == 0 {
            return Err(PoolError::InvalidArgument("pool needs at least one thread".into()));
        }

        let prefix = self.thread_name_prefix.unwrap_or_else(|| self.name.clone());
        let shared = Arc::new(Shared {
            name: self.name,
            state: Mutex::new(PoolState {
                queue: BinaryHeap::new(),
                running: HashMap::new(),
                run_state: RunState::Running,
                live_workers: self.threads,
            }),
            available: Condvar::new(),
            terminated: Condvar::new(),
            sequence: AtomicU64::new(0),
            metrics: MetricsRecorder::default(),
            pool_size: self.threads,
            keep_alive: self.keep_alive,
            accept_queue_size: self.accept_queue_size,
        });

        let pool = BoundedScheduledPool {
            shared: Arc::clone(&shared),
            rejection: self.rejection,
            workers: Mutex::new(Vec::with_capacity(self.threads)),
        };

        for n in 1..=self.threads {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("{prefix}-{n}"))
                .spawn(move || worker_shared.worker_loop(n));
            match spawned {
                Ok(handle) => lock(&pool.workers).push(handle),
                Err(e) => {
                    error!(pool = %shared.name, worker = n, error = %e, "failed to spawn worker");
                    {
                        let mut state = lock(&shared.state);
                        state.live_workers -= self.threads - n + 1;
                    }
                    pool.shutdown();
                    return Err(PoolError::Spawn(e));
                }
            }
        }

        info!(
            "Pool '{}' started with {} workers, accept queue {}",
            shared.name, self.threads, self.accept_queue_size
        );
        Ok(pool)
    }
}
