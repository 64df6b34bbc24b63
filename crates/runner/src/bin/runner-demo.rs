//! runner-demo: drives a task runner end to end.
//!
//! Loads `RunnerProperties` (TOML file, then `GANTRY_RUNNER_*` env vars),
//! starts an Async runner whose master task schedules a jittered heartbeat,
//! submits a timed batch, then closes the runner and prints pool metrics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use gantry_core::{load_dotenv, RunnerProperties, StartupMode};
use gantry_runner::{
    BatchJob, BatchWaiter, FnJob, FnTask, Interrupt, LogOnTimeout, RunnerConfig, RunnerContext,
    TaskRunner,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Bounded task runner demo: jittered periodic job plus a timed batch.
#[derive(Parser, Debug)]
#[command(name = "runner-demo", version, about)]
struct Cli {
    /// Path to a runner TOML config file. Defaults are used when absent.
    #[arg(long, env = "GANTRY_RUNNER_CONFIG")]
    config: Option<String>,

    /// Lower bound of the heartbeat period in milliseconds.
    #[arg(long, default_value_t = 50)]
    min_period_ms: u64,

    /// Upper bound (exclusive) of the heartbeat period in milliseconds.
    #[arg(long, default_value_t = 150)]
    max_period_ms: u64,

    /// Number of jobs in the batch.
    #[arg(long, default_value_t = 8)]
    batch_size: usize,

    /// Duration of each batch job in milliseconds.
    #[arg(long, default_value_t = 100)]
    job_ms: u64,

    /// Batch timeout in milliseconds.
    #[arg(long, default_value_t = 1_000)]
    batch_timeout_ms: u64,

    /// How long to let the runner work before closing it, in milliseconds.
    #[arg(long, default_value_t = 2_000)]
    run_for_ms: u64,
}

fn load_properties(cli: &Cli) -> Result<RunnerProperties> {
    let mut props = match &cli.config {
        Some(path) => RunnerProperties::from_file(path)
            .with_context(|| format!("failed to load runner config from {path}"))?,
        None => {
            let mut props = RunnerProperties::with_pool(4, 16);
            props.apply_env_overrides()?;
            props.validate()?;
            props
        }
    };
    if props.startup_mode != StartupMode::Async {
        warn!(mode = %props.startup_mode, "demo needs an async master, overriding startup mode");
        props.startup_mode = StartupMode::Async;
    }
    Ok(props)
}

fn master(cli: &Cli, ctx: &RunnerContext) -> Result<()> {
    let pool = ctx.worker()?;
    let beats = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&beats);
    let heartbeat = pool.schedule_at_random_rate(
        Duration::ZERO,
        Duration::from_millis(cli.min_period_ms),
        Duration::from_millis(cli.max_period_ms),
        move |_| {
            let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
            info!(beat = n, "heartbeat");
            Ok(())
        },
    )?;

    let job_time = Duration::from_millis(cli.job_ms);
    let jobs: Vec<Arc<dyn BatchJob>> = (0..cli.batch_size)
        .map(|i| {
            let job: Arc<dyn BatchJob> = Arc::new(FnJob::new(
                format!("batch-{i}"),
                move |interrupt: &Interrupt| -> anyhow::Result<()> {
                    if !interrupt.sleep(job_time) {
                        anyhow::bail!("interrupted");
                    }
                    Ok(())
                },
            ));
            job
        })
        .collect();

    let report = BatchWaiter::new(pool).submit_for_complete(
        jobs,
        Duration::from_millis(cli.batch_timeout_ms),
        &LogOnTimeout,
    )?;
    info!(
        completed = report.completed,
        rejected = report.rejected,
        remaining = report.remaining.len(),
        timed_out = report.timed_out(),
        "batch finished"
    );

    ctx.interrupt().wait();
    heartbeat.cancel(false);
    info!(beats = beats.load(Ordering::Relaxed), "master task stopping");
    Ok(())
}

fn main() -> Result<()> {
    load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Arc::new(Cli::parse());
    let props = load_properties(&cli)?;
    let config = RunnerConfig::new(props).context("invalid runner config")?;

    let task_cli = Arc::clone(&cli);
    let runner = TaskRunner::new(
        "runner-demo",
        config,
        FnTask(move |ctx: &RunnerContext| -> anyhow::Result<()> { master(&task_cli, ctx) }),
    );

    runner.start()?;
    let pool = runner.worker()?;
    std::thread::sleep(Duration::from_millis(cli.run_for_ms));
    runner.close();

    let metrics = pool.metrics();
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}
