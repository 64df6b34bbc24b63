//! Integration tests for gantry-runner.
//!
//! Drive the public API end to end: runner lifecycle, queue bounds,
//! jittered scheduling and batch waits.

use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use gantry_runner::*;

// Env-based tests must run serially to avoid interfering with each other.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_runner_env() {
    let keys = [
        "GANTRY_RUNNER_STARTUP_MODE",
        "GANTRY_RUNNER_CONCURRENCY",
        "GANTRY_RUNNER_KEEP_ALIVE_MS",
        "GANTRY_RUNNER_ACCEPT_QUEUE_SIZE",
        "GANTRY_RUNNER_REJECTION",
        "GANTRY_RUNNER_SHUTDOWN_TIMEOUT_MS",
        "GANTRY_RUNNER_THREAD_NAME_PREFIX",
    ];
    for k in keys {
        env::remove_var(k);
    }
}

/// Abort policy that also records every rejection it sees.
#[derive(Default)]
struct RecordingAbort {
    events: Mutex<Vec<u64>>,
}

impl RejectionPolicy for RecordingAbort {
    fn rejected(&self, job: RejectedJob, pool: &BoundedScheduledPool) -> Result<(), RejectedError> {
        self.events.lock().unwrap().push(job.sequence());
        Err(job.to_error(pool))
    }

    fn name(&self) -> &str {
        "recording_abort"
    }
}

fn pool_runner(
    name: &str,
    concurrency: i32,
    queue: i64,
    policy: Arc<dyn RejectionPolicy>,
) -> TaskRunner<NoopTask> {
    let mut props = RunnerProperties::with_pool(concurrency, queue);
    props.startup_mode = StartupMode::NoStartup;
    props.shutdown_timeout_ms = 2_000;
    let config = RunnerConfig::new(props).unwrap().with_rejection_policy(policy);
    let runner = TaskRunner::new(name, config, NoopTask);
    runner.start().unwrap();
    runner
}

// ── Queue bound ──────────────────────────────────────────────────────

#[test]
fn test_five_jobs_two_rejections() {
    let policy = Arc::new(RecordingAbort::default());
    let runner = pool_runner("scenario", 1, 2, policy.clone());
    let pool = runner.worker().unwrap();

    let mut handles = Vec::new();
    let mut errors = 0;
    for i in 0..5 {
        match pool.submit(move |_| {
            thread::sleep(Duration::from_millis(100));
            Ok(i)
        }) {
            Ok(h) => handles.push(h),
            Err(PoolError::Rejected(_)) => errors += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(errors, 2);
    assert_eq!(policy.events.lock().unwrap().len(), 2);
    assert_eq!(pool.active() + pool.queued(), 3);

    let done: Vec<i32> = handles.into_iter().map(|h| h.wait().unwrap()).collect();
    assert_eq!(done, vec![0, 1, 2]);
    assert_eq!(pool.metrics().rejected, 2);
}

#[test]
fn test_queue_bound_q_plus_two() {
    for q in [0usize, 1, 3] {
        let policy = Arc::new(RecordingAbort::default());
        let runner = pool_runner("bound", 1, q as i64, policy.clone());
        let pool = runner.worker().unwrap();

        let gate = Interrupt::new();
        let mut accepted = Vec::new();
        for _ in 0..q + 2 {
            let gate = gate.clone();
            if let Ok(h) = pool.submit(move |_| {
                gate.wait();
                Ok(())
            }) {
                accepted.push(h);
            }
        }

        // one running, q queued, the last one rejected
        assert_eq!(accepted.len(), q + 1, "q = {q}");
        assert_eq!(policy.events.lock().unwrap().len(), 1, "q = {q}");
        assert!(pool.queued() <= q);

        gate.raise();
        for h in accepted {
            h.wait().unwrap();
        }
        runner.close();
    }
}

// ── Jittered scheduling ──────────────────────────────────────────────

#[test]
fn test_random_delay_gaps_within_bounds() {
    let runner = pool_runner("jitter", 1, 4, Arc::new(AbortPolicy));
    let pool = runner.worker().unwrap();

    let min = Duration::from_millis(20);
    let max = Duration::from_millis(40);
    let starts = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&starts);

    let handle = pool
        .schedule_with_random_delay(Duration::ZERO, min, max, move |_| {
            log.lock().unwrap().push(Instant::now());
            Ok(())
        })
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while starts.lock().unwrap().len() < 8 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    handle.cancel(false);

    let starts = starts.lock().unwrap().clone();
    assert!(starts.len() >= 8, "only {} runs", starts.len());
    for pair in starts.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= min, "gap {gap:?} below {min:?}");
        // generous slack for scheduler wake-up latency
        assert!(gap < max + Duration::from_millis(200), "gap {gap:?} far above {max:?}");
    }
}

#[test]
fn test_random_rate_keeps_running_until_shutdown() {
    let runner = pool_runner("rate", 2, 4, Arc::new(AbortPolicy));
    let pool = runner.worker().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);

    let handle = pool
        .schedule_at_random_rate(
            Duration::from_millis(5),
            Duration::from_millis(5),
            Duration::from_millis(15),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while runs.load(Ordering::SeqCst) < 5 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(runs.load(Ordering::SeqCst) >= 5);

    runner.close();
    assert!(handle.is_cancelled());
    assert!(pool.is_terminated());
}

// ── Batch wait ───────────────────────────────────────────────────────

fn sleeping_jobs(count: usize, millis: u64) -> Vec<Arc<dyn BatchJob>> {
    (0..count)
        .map(|i| {
            let job: Arc<dyn BatchJob> = Arc::new(FnJob::new(
                format!("job-{i}"),
                move |interrupt: &Interrupt| -> anyhow::Result<()> {
                    interrupt.sleep(Duration::from_millis(millis));
                    Ok(())
                },
            ));
            job
        })
        .collect()
}

#[test]
fn test_batch_timeout_reports_partial_completion() {
    let runner = pool_runner("batch-timeout", 2, 16, Arc::new(AbortPolicy));
    let pool = runner.worker().unwrap();

    let report = pool
        .submit_for_complete(sleeping_jobs(6, 300), Duration::from_millis(100), &LogOnTimeout)
        .unwrap();

    let timeout = report.timeout.clone().expect("batch should time out");
    assert_eq!(timeout.total, 6);
    assert!(report.completed < 6);
    assert!(!report.remaining.is_empty());
    assert_eq!(report.completed + report.remaining.len(), 6);
}

#[test]
fn test_batch_within_timeout_reports_full_completion() {
    let runner = pool_runner("batch-ok", 3, 16, Arc::new(AbortPolicy));
    let pool = runner.worker().unwrap();

    let report = BatchWaiter::new(&pool)
        .submit_all(sleeping_jobs(6, 20), Duration::from_secs(5))
        .unwrap();

    assert!(report.timeout.is_none());
    assert_eq!(report.completed, 6);
    assert!(report.remaining.is_empty());
}

#[test]
fn test_batch_timeout_as_error() {
    let runner = pool_runner("batch-fail", 1, 16, Arc::new(AbortPolicy));
    let pool = runner.worker().unwrap();

    let err = BatchWaiter::new(&pool)
        .submit_for_complete(sleeping_jobs(3, 500), Duration::from_millis(50), &FailOnTimeout)
        .unwrap_err();
    assert!(matches!(err, BatchError::Timeout(BatchTimeout { total: 3, .. })));
}

// ── Runner lifecycle ─────────────────────────────────────────────────

#[test]
fn test_runner_start_close_idempotent() {
    let runner = pool_runner("idempotent", 2, 2, Arc::new(AbortPolicy));
    let first = runner.worker().unwrap();
    runner.start().unwrap();
    assert!(Arc::ptr_eq(&first, &runner.worker().unwrap()));

    runner.close();
    runner.close();
    assert_eq!(runner.state(), TaskState::Closed);
    assert!(first.is_terminated());
}

#[test]
fn test_runner_from_toml_with_env_override() {
    let _lock = ENV_LOCK.lock().unwrap();
    clear_runner_env();
    env::set_var("GANTRY_RUNNER_CONCURRENCY", "3");
    env::set_var("GANTRY_RUNNER_REJECTION", "caller-runs");

    let props = RunnerProperties::from_toml(
        r#"
        startup_mode = "no_startup"
        concurrency = 1
        accept_queue_size = 0
        "#,
    )
    .unwrap();
    clear_runner_env();

    assert_eq!(props.concurrency, 3);
    assert_eq!(props.rejection, RejectionKind::CallerRuns);

    let runner = TaskRunner::new("from-toml", RunnerConfig::new(props).unwrap(), NoopTask);
    runner.start().unwrap();
    let pool = runner.worker().unwrap();
    assert_eq!(pool.pool_size(), 3);
    assert_eq!(pool.accept_queue_size(), 0);
}

#[test]
fn test_invalid_env_override_fails() {
    let _lock = ENV_LOCK.lock().unwrap();
    clear_runner_env();
    env::set_var("GANTRY_RUNNER_ACCEPT_QUEUE_SIZE", "-4");

    let result = RunnerProperties::from_toml("concurrency = 2");
    clear_runner_env();

    assert!(matches!(result, Err(ConfigError::InvalidArgument(_))));
}
