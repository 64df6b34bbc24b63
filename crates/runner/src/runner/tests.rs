use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use gantry_core::{ConfigError, RunnerProperties, StartupMode};

use crate::error::RunnerError;
use crate::pool::BoundedScheduledPool;
use crate::rejection::{RejectedError, RejectedJob, RejectionPolicy};
use crate::sync::lock;

use super::{FnTask, NoopTask, RunnerConfig, RunnerContext, RunnerTask, TaskRunner, TaskState};

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn config(mode: StartupMode, concurrency: i32, queue: i64) -> RunnerConfig {
    let mut props = RunnerProperties::with_pool(concurrency, queue);
    props.startup_mode = mode;
    props.shutdown_timeout_ms = 1_000;
    RunnerConfig::new(props).unwrap()
}

#[derive(Default)]
struct Recorder {
    runs: AtomicUsize,
    starting: AtomicUsize,
    started: AtomicUsize,
    closing: AtomicUsize,
    closed: AtomicUsize,
}

struct RecordingTask(Arc<Recorder>);

impl RunnerTask for RecordingTask {
    fn run(&self, _ctx: &RunnerContext) -> anyhow::Result<()> {
        self.0.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_starting(&self) {
        self.0.starting.fetch_add(1, Ordering::SeqCst);
    }

    fn on_started(&self) {
        self.0.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_closing(&self) {
        self.0.closing.fetch_add(1, Ordering::SeqCst);
    }

    fn on_closed(&self) {
        self.0.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn start_twice_starts_once() {
    let recorder = Arc::new(Recorder::default());
    let runner = TaskRunner::new(
        "twice",
        config(StartupMode::Sync, 2, 4),
        RecordingTask(Arc::clone(&recorder)),
    );

    runner.start().unwrap();
    let first = runner.worker().unwrap();
    runner.start().unwrap();
    let second = runner.worker().unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(recorder.runs.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.starting.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.started.load(Ordering::SeqCst), 1);
    assert_eq!(runner.state(), TaskState::Running);
}

#[test]
fn close_twice_closes_once() {
    let recorder = Arc::new(Recorder::default());
    let runner = TaskRunner::new(
        "close-twice",
        config(StartupMode::NoStartup, 1, 1),
        RecordingTask(Arc::clone(&recorder)),
    );
    runner.start().unwrap();
    let pool = runner.worker().unwrap();

    runner.close();
    runner.close();

    assert_eq!(recorder.closing.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.closed.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.runs.load(Ordering::SeqCst), 0);
    assert_eq!(runner.state(), TaskState::Closed);
    assert!(!runner.is_started());
    assert!(pool.is_terminated());
    assert!(matches!(runner.worker(), Err(RunnerError::IllegalState(_))));
}

#[test]
fn closed_runner_does_not_restart() {
    let runner = TaskRunner::new("single-use", config(StartupMode::NoStartup, 1, 1), NoopTask);
    runner.start().unwrap();
    runner.close();
    runner.start().unwrap();
    assert_eq!(runner.state(), TaskState::Closed);
    assert!(runner.worker().is_err());
}

#[test]
fn close_before_start_is_ignored() {
    let recorder = Arc::new(Recorder::default());
    let runner = TaskRunner::new(
        "early-close",
        config(StartupMode::NoStartup, 1, 1),
        RecordingTask(Arc::clone(&recorder)),
    );
    runner.close();
    assert_eq!(runner.state(), TaskState::Idle);
    assert_eq!(recorder.closing.load(Ordering::SeqCst), 0);

    runner.start().unwrap();
    assert!(runner.is_started());
}

#[test]
fn worker_requires_pool() {
    let runner = TaskRunner::new("no-pool", RunnerConfig::default(), NoopTask);
    assert!(matches!(runner.worker(), Err(RunnerError::IllegalState(_))));

    runner.start().unwrap();
    assert!(runner.is_started());
    assert!(matches!(runner.worker(), Err(RunnerError::IllegalState(_))));
}

#[test]
fn sync_master_runs_on_caller_thread() {
    let seen = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&seen);
    let runner = TaskRunner::new(
        "sync",
        config(StartupMode::Sync, -1, 1),
        FnTask(move |ctx: &RunnerContext| -> anyhow::Result<()> {
            *lock(&slot) = Some((thread::current().id(), ctx.name().to_string()));
            Ok(())
        }),
    );

    runner.start().unwrap();
    assert_eq!(
        *lock(&seen),
        Some((thread::current().id(), "sync".to_string()))
    );
    // the master returned with start(), so nothing is left running
    assert!(!runner.is_active());
    assert!(runner.is_started());

    runner.close();
    assert!(!runner.is_active());
}

#[test]
fn sync_master_is_active_while_running() {
    let runner = Arc::new(TaskRunner::new(
        "sync-active",
        config(StartupMode::Sync, -1, 1),
        FnTask(|ctx: &RunnerContext| -> anyhow::Result<()> {
            ctx.interrupt().sleep(Duration::from_millis(300));
            Ok(())
        }),
    ));
    let starter = Arc::clone(&runner);
    let start = thread::spawn(move || starter.start());

    assert!(wait_until(|| runner.is_active()));
    start.join().unwrap().unwrap();
    assert!(!runner.is_active());
}

#[test]
fn sync_master_error_is_returned() {
    let runner = TaskRunner::new(
        "sync-fail",
        config(StartupMode::Sync, 1, 1),
        FnTask(|_: &RunnerContext| -> anyhow::Result<()> { anyhow::bail!("bootstrap failed") }),
    );

    match runner.start() {
        Err(RunnerError::Task(err)) => assert!(err.to_string().contains("bootstrap failed")),
        other => panic!("expected task error, got {other:?}"),
    }
    assert_eq!(runner.state(), TaskState::Running);
    runner.close();
    assert_eq!(runner.state(), TaskState::Closed);
}

#[test]
fn async_master_runs_until_interrupted() {
    let thread_name = Arc::new(Mutex::new(None));
    let exited = Arc::new(AtomicBool::new(false));
    let (name_slot, exit_flag) = (Arc::clone(&thread_name), Arc::clone(&exited));

    let runner = TaskRunner::new(
        "async",
        config(StartupMode::Async, -1, 1),
        FnTask(move |ctx: &RunnerContext| -> anyhow::Result<()> {
            *lock(&name_slot) = thread::current().name().map(str::to_string);
            ctx.interrupt().wait();
            exit_flag.store(true, Ordering::SeqCst);
            Ok(())
        }),
    );

    runner.start().unwrap();
    assert!(wait_until(|| lock(&thread_name).is_some()));
    assert_eq!(lock(&thread_name).as_deref(), Some("async-master"));
    assert!(runner.is_active());
    assert!(!exited.load(Ordering::SeqCst));

    runner.close();
    assert!(!runner.is_active());
    assert!(wait_until(|| exited.load(Ordering::SeqCst)));
}

#[test]
fn master_submits_to_worker_pool() {
    let result = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&result);

    let runner = TaskRunner::new(
        "async-pool",
        config(StartupMode::Async, 2, 4),
        FnTask(move |ctx: &RunnerContext| -> anyhow::Result<()> {
            let pool = ctx.worker()?;
            let handle = pool.submit(|_| Ok(21 * 2))?;
            *lock(&slot) = Some(handle.wait()?);
            Ok(())
        }),
    );

    runner.start().unwrap();
    assert!(wait_until(|| lock(&result).is_some()));
    assert_eq!(*lock(&result), Some(42));
}

#[test]
fn close_forces_shutdown_after_timeout() {
    let mut props = RunnerProperties::with_pool(1, 1);
    props.startup_mode = StartupMode::NoStartup;
    props.shutdown_timeout_ms = 50;
    let runner = TaskRunner::new("stubborn", RunnerConfig::new(props).unwrap(), NoopTask);
    runner.start().unwrap();

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    let pool = runner.worker().unwrap();
    let handle = pool
        .submit(move |interrupt| {
            interrupt.wait();
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    assert!(wait_until(|| pool.active() == 1));

    let started = Instant::now();
    runner.close();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(wait_until(|| interrupted.load(Ordering::SeqCst)));
    assert!(handle.wait_for(Duration::from_secs(5)));
    assert!(pool.is_shutdown());
}

#[test]
fn drop_closes_runner() {
    let recorder = Arc::new(Recorder::default());
    let pool = {
        let runner = TaskRunner::new(
            "dropped",
            config(StartupMode::NoStartup, 1, 1),
            RecordingTask(Arc::clone(&recorder)),
        );
        runner.start().unwrap();
        runner.worker().unwrap()
    };
    assert_eq!(recorder.closed.load(Ordering::SeqCst), 1);
    assert!(pool.is_shutdown());
}

#[test]
fn worker_threads_use_prefix() {
    let mut props = RunnerProperties::with_pool(1, 1);
    props.startup_mode = StartupMode::NoStartup;
    props.thread_name_prefix = Some("gw-sync".into());
    let runner = TaskRunner::new("prefixed", RunnerConfig::new(props).unwrap(), NoopTask);
    runner.start().unwrap();

    let name = runner
        .worker()
        .unwrap()
        .submit(|_| Ok(thread::current().name().map(str::to_string)))
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(name.as_deref(), Some("gw-sync-1"));
}

#[test]
fn config_rejects_negative_pool_fields() {
    let props = RunnerProperties::with_pool(2, -1);
    assert!(matches!(RunnerConfig::new(props), Err(ConfigError::InvalidArgument(_))));

    // ignored without a pool
    let props = RunnerProperties::with_pool(0, -1);
    assert!(RunnerConfig::new(props).is_ok());
}

struct CountingPolicy(AtomicUsize);

impl RejectionPolicy for CountingPolicy {
    fn rejected(&self, job: RejectedJob, pool: &BoundedScheduledPool) -> Result<(), RejectedError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Err(job.to_error(pool))
    }

    fn name(&self) -> &str {
        "counting"
    }
}

#[test]
fn custom_rejection_policy_reaches_pool() {
    let policy = Arc::new(CountingPolicy(AtomicUsize::new(0)));
    let config = config(StartupMode::NoStartup, 1, 0).with_rejection_policy(policy.clone());
    assert_eq!(config.rejection_policy().name(), "counting");

    let runner = TaskRunner::new("custom-policy", config, NoopTask);
    runner.start().unwrap();
    let pool = runner.worker().unwrap();

    let blocker = pool
        .submit(|interrupt| {
            interrupt.sleep(Duration::from_secs(5));
            Ok(())
        })
        .unwrap();
    assert!(wait_until(|| pool.active() == 1));

    assert!(pool.submit(|_| Ok(())).is_err());
    assert_eq!(policy.0.load(Ordering::SeqCst), 1);
    blocker.cancel(true);
}

/// Closes its own runner from `on_starting`, before the pool exists.
#[derive(Default)]
struct CloseDuringStart {
    runner: Mutex<Weak<TaskRunner<CloseDuringStart>>>,
    pool: Mutex<Option<Arc<BoundedScheduledPool>>>,
    exited: AtomicBool,
}

impl RunnerTask for CloseDuringStart {
    fn run(&self, ctx: &RunnerContext) -> anyhow::Result<()> {
        *lock(&self.pool) = Some(Arc::clone(ctx.worker()?));
        ctx.interrupt().wait();
        self.exited.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn on_starting(&self) {
        if let Some(runner) = lock(&self.runner).upgrade() {
            runner.close();
        }
    }
}

#[test]
fn close_racing_start_releases_pool_and_master() {
    let runner = Arc::new(TaskRunner::new(
        "close-race",
        config(StartupMode::Async, 2, 2),
        CloseDuringStart::default(),
    ));
    *lock(&runner.task().runner) = Arc::downgrade(&runner);

    runner.start().unwrap();

    assert_eq!(runner.state(), TaskState::Closed);
    assert!(matches!(runner.worker(), Err(RunnerError::IllegalState(_))));
    assert!(!runner.is_active());
    assert!(wait_until(|| runner.task().exited.load(Ordering::SeqCst)));
    let pool = lock(&runner.task().pool).clone().unwrap();
    assert!(pool.is_shutdown());
    assert!(wait_until(|| pool.is_terminated()));
}
