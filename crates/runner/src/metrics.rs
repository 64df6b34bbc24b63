use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::sync::{read, write};

/// Pool operational metrics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    /// Number of worker threads.
    pub pool_size: usize,
    /// Jobs waiting in the queue (including periodic jobs between runs).
    pub queued: usize,
    /// Jobs currently executing on workers.
    pub active: usize,
    /// Worker utilization ratio (0.0 - 1.0).
    pub worker_utilization: f64,
    /// Jobs admitted into the queue.
    pub submitted: u64,
    /// Successful runs (every run of a periodic job counts).
    pub completed: u64,
    /// Runs that returned an error or panicked.
    pub failed: u64,
    pub cancelled: u64,
    /// Submissions handed to the rejection policy.
    pub rejected: u64,
    /// Average run duration.
    pub avg_run_duration: Duration,
    /// Wall-clock time of the last finished run.
    pub last_run: Option<DateTime<Utc>>,
}

impl Default for PoolMetrics {
    fn default() -> Self {
        Self {
            pool_size: 0,
            queued: 0,
            active: 0,
            worker_utilization: 0.0,
            submitted: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            rejected: 0,
            avg_run_duration: Duration::ZERO,
            last_run: None,
        }
    }
}

impl PoolMetrics {
    /// Record one finished run.
    pub fn record_execution(&mut self, duration: Duration, succeeded: bool) {
        if succeeded {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        self.last_run = Some(Utc::now());

        let count = self.completed + self.failed;

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        self.avg_run_duration = if count == 1 {
            duration
        } else {
            let prev_nanos = self.avg_run_duration.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };
    }

    /// Total runs observed.
    pub fn runs(&self) -> u64 {
        self.completed + self.failed
    }
}

/// Shared counters behind [`PoolMetrics`] snapshots.
#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    inner: RwLock<PoolMetrics>,
}

impl MetricsRecorder {
    pub(crate) fn record_submitted(&self) {
        write(&self.inner).submitted += 1;
    }

    pub(crate) fn record_rejected(&self) {
        write(&self.inner).rejected += 1;
    }

    pub(crate) fn record_cancelled(&self, count: usize) {
        if count > 0 {
            write(&self.inner).cancelled += count as u64;
        }
    }

    pub(crate) fn record_execution(&self, duration: Duration, succeeded: bool) {
        write(&self.inner).record_execution(duration, succeeded);
    }

    pub(crate) fn snapshot(&self, pool_size: usize, queued: usize, active: usize) -> PoolMetrics {
        let mut m = read(&self.inner).clone();
        m.pool_size = pool_size;
        m.queued = queued;
        m.active = active;
        m.worker_utilization = if pool_size == 0 {
            0.0
        } else {
            active as f64 / pool_size as f64
        };
        m
    }
}
