use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "GANTRY_RUNNER_";

// ── Enums ─────────────────────────────────────────────────────

/// How the master task is dispatched by `start()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupMode {
    /// Run the master task on the caller's thread; `start()` blocks until it returns.
    #[default]
    Sync,
    /// Run the master task on one dedicated background thread.
    Async,
    /// Do not run a master task at all.
    NoStartup,
}

impl FromStr for StartupMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "sync" => Ok(Self::Sync),
            "async" => Ok(Self::Async),
            "no_startup" | "none" => Ok(Self::NoStartup),
            other => Err(ConfigError::InvalidArgument(format!(
                "unknown startup mode '{other}'"
            ))),
        }
    }
}

impl fmt::Display for StartupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sync => "sync",
            Self::Async => "async",
            Self::NoStartup => "no_startup",
        };
        f.write_str(s)
    }
}

/// Built-in behaviour when the accept queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    /// Report the rejection to the submitter as an error.
    #[default]
    Abort,
    /// Run the job inline on the submitting thread.
    CallerRuns,
    /// Drop the job silently.
    Discard,
    /// Drop the oldest queued job and retry the submission.
    DiscardOldest,
}

impl FromStr for RejectionKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "abort" => Ok(Self::Abort),
            "caller_runs" => Ok(Self::CallerRuns),
            "discard" => Ok(Self::Discard),
            "discard_oldest" => Ok(Self::DiscardOldest),
            other => Err(ConfigError::InvalidArgument(format!(
                "unknown rejection policy '{other}'"
            ))),
        }
    }
}

impl fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Abort => "abort",
            Self::CallerRuns => "caller_runs",
            Self::Discard => "discard",
            Self::DiscardOldest => "discard_oldest",
        };
        f.write_str(s)
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_ascii_lowercase().replace('-', "_")
}

// ── RunnerProperties ──────────────────────────────────────────

/// Task runner configuration, typically parsed from TOML.
///
/// `keep_alive_ms` and `accept_queue_size` are signed so that a bad value can
/// be reported instead of silently wrapping; they are only checked when a
/// worker pool is requested (`concurrency > 0`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerProperties {
    /// Master task dispatch mode.
    #[serde(default)]
    pub startup_mode: StartupMode,
    /// Worker thread count. `<= 0` means no pool.
    #[serde(default = "default_concurrency")]
    pub concurrency: i32,
    /// Worker keep-alive in milliseconds.
    #[serde(default)]
    pub keep_alive_ms: i64,
    /// Maximum number of queued (not yet running) jobs.
    #[serde(default = "default_accept_queue_size")]
    pub accept_queue_size: i64,
    /// Policy applied when the accept queue is full.
    #[serde(default)]
    pub rejection: RejectionKind,
    /// How long `close()` waits for the pool to drain.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Thread name prefix. Defaults to the runner name.
    #[serde(default)]
    pub thread_name_prefix: Option<String>,
}

fn default_concurrency() -> i32 { -1 }
fn default_accept_queue_size() -> i64 { 1 }
fn default_shutdown_timeout_ms() -> u64 { 10_000 }

impl Default for RunnerProperties {
    fn default() -> Self {
        Self {
            startup_mode: StartupMode::default(),
            concurrency: default_concurrency(),
            keep_alive_ms: 0,
            accept_queue_size: default_accept_queue_size(),
            rejection: RejectionKind::default(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            thread_name_prefix: None,
        }
    }
}

impl RunnerProperties {
    /// Properties for a runner with a pool of `concurrency` workers.
    pub fn with_pool(concurrency: i32, accept_queue_size: i64) -> Self {
        Self {
            concurrency,
            accept_queue_size,
            ..Self::default()
        }
    }

    /// Parse properties from a TOML string, apply env overrides and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut props: Self = toml::from_str(toml_str)?;
        props.apply_env_overrides()?;
        props.validate()?;
        Ok(props)
    }

    /// Load properties from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Whether a worker pool is requested.
    pub fn has_pool(&self) -> bool {
        self.concurrency > 0
    }

    /// Number of worker threads, zero when no pool is requested.
    pub fn pool_size(&self) -> usize {
        if self.has_pool() {
            self.concurrency as usize
        } else {
            0
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms.max(0) as u64)
    }

    /// Accept queue bound as an unsigned count.
    pub fn accept_queue_limit(&self) -> usize {
        self.accept_queue_size.max(0) as usize
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn set_concurrency(&mut self, concurrency: i32) {
        self.concurrency = concurrency;
    }

    /// Set the keep-alive, rejecting negative values when a pool is requested.
    pub fn set_keep_alive_ms(&mut self, keep_alive_ms: i64) -> Result<(), ConfigError> {
        if self.has_pool() && keep_alive_ms < 0 {
            return Err(ConfigError::InvalidArgument(format!(
                "keep_alive_ms must be >= 0, got {keep_alive_ms}"
            )));
        }
        self.keep_alive_ms = keep_alive_ms;
        Ok(())
    }

    /// Set the accept queue bound, rejecting negative values when a pool is requested.
    pub fn set_accept_queue_size(&mut self, accept_queue_size: i64) -> Result<(), ConfigError> {
        if self.has_pool() && accept_queue_size < 0 {
            return Err(ConfigError::InvalidArgument(format!(
                "accept_queue_size must be >= 0, got {accept_queue_size}"
            )));
        }
        self.accept_queue_size = accept_queue_size;
        Ok(())
    }

    /// Validate the pool fields. Without a pool they are not inspected.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.has_pool() {
            return Ok(());
        }
        if self.keep_alive_ms < 0 {
            return Err(ConfigError::InvalidArgument(format!(
                "keep_alive_ms must be >= 0, got {}",
                self.keep_alive_ms
            )));
        }
        if self.accept_queue_size < 0 {
            return Err(ConfigError::InvalidArgument(format!(
                "accept_queue_size must be >= 0, got {}",
                self.accept_queue_size
            )));
        }
        Ok(())
    }

    // ── Environment variable overrides ──────────────────────────

    /// Apply `GANTRY_RUNNER_*` environment overrides.
    ///
    /// - `GANTRY_RUNNER_STARTUP_MODE` -> `startup_mode`
    /// - `GANTRY_RUNNER_CONCURRENCY` -> `concurrency`
    /// - `GANTRY_RUNNER_KEEP_ALIVE_MS` -> `keep_alive_ms`
    /// - `GANTRY_RUNNER_ACCEPT_QUEUE_SIZE` -> `accept_queue_size`
    /// - `GANTRY_RUNNER_REJECTION` -> `rejection`
    /// - `GANTRY_RUNNER_SHUTDOWN_TIMEOUT_MS` -> `shutdown_timeout_ms`
    /// - `GANTRY_RUNNER_THREAD_NAME_PREFIX` -> `thread_name_prefix`
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| env::var(format!("{ENV_PREFIX}{key}")).ok())
    }

    /// Apply overrides from an arbitrary key lookup (keys without prefix).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("STARTUP_MODE") {
            self.startup_mode = v.parse()?;
        }
        if let Some(v) = get("CONCURRENCY") {
            self.concurrency = parse_number("CONCURRENCY", &v)?;
        }
        if let Some(v) = get("KEEP_ALIVE_MS") {
            self.keep_alive_ms = parse_number("KEEP_ALIVE_MS", &v)?;
        }
        if let Some(v) = get("ACCEPT_QUEUE_SIZE") {
            self.accept_queue_size = parse_number("ACCEPT_QUEUE_SIZE", &v)?;
        }
        if let Some(v) = get("REJECTION") {
            self.rejection = v.parse()?;
        }
        if let Some(v) = get("SHUTDOWN_TIMEOUT_MS") {
            self.shutdown_timeout_ms = parse_number("SHUTDOWN_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("THREAD_NAME_PREFIX") {
            self.thread_name_prefix = Some(v);
        }
        Ok(())
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self, runner: &str) {
        tracing::info!("Runner config loaded ({}):", runner);
        tracing::info!("  startup:     mode={}", self.startup_mode);
        if self.has_pool() {
            tracing::info!(
                "  pool:        threads={}, keep_alive={}ms, accept_queue={}",
                self.concurrency,
                self.keep_alive_ms,
                self.accept_queue_size
            );
            tracing::info!("  rejection:   {}", self.rejection);
        } else {
            tracing::info!("  pool:        (none)");
        }
        tracing::info!("  shutdown:    timeout={}ms", self.shutdown_timeout_ms);
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| {
        ConfigError::InvalidArgument(format!("{ENV_PREFIX}{key}: '{value}' is not a number"))
    })
}
