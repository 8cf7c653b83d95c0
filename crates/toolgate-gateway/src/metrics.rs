//! Gateway telemetry
//!
//! Counters accumulate lock-free; a periodic worker flushes a snapshot to
//! the log on the configured interval and exits when the run scope is
//! cancelled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Process-wide counters
#[derive(Default)]
pub struct MetricsRegistry {
    tool_calls: AtomicU64,
    tool_errors: AtomicU64,
    capability_reloads: AtomicU64,
    reload_failures: AtomicU64,
    refresh_attempts: AtomicU64,
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub tool_calls: u64,
    pub tool_errors: u64,
    pub capability_reloads: u64,
    pub reload_failures: u64,
    pub refresh_attempts: u64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tool_call(&self) {
        self.tool_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tool_error(&self) {
        self.tool_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capability_reload(&self) {
        self.capability_reloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reload_failure(&self) {
        self.reload_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_attempt(&self) {
        self.refresh_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tool_calls: self.tool_calls.load(Ordering::Relaxed),
            tool_errors: self.tool_errors.load(Ordering::Relaxed),
            capability_reloads: self.capability_reloads.load(Ordering::Relaxed),
            reload_failures: self.reload_failures.load(Ordering::Relaxed),
            refresh_attempts: self.refresh_attempts.load(Ordering::Relaxed),
        }
    }
}

/// Spawn the periodic telemetry flush worker.
pub fn start_flush_worker(
    metrics: Arc<MetricsRegistry>,
    interval: Duration,
    verbose: bool,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The immediate first tick would flush all-zero counters
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("[Metrics] Flush worker stopped");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let s = metrics.snapshot();
            if verbose {
                info!(
                    tool_calls = s.tool_calls,
                    tool_errors = s.tool_errors,
                    capability_reloads = s.capability_reloads,
                    reload_failures = s.reload_failures,
                    refresh_attempts = s.refresh_attempts,
                    "[Metrics] Telemetry snapshot"
                );
            } else {
                debug!(
                    tool_calls = s.tool_calls,
                    tool_errors = s.tool_errors,
                    "[Metrics] Telemetry snapshot"
                );
            }
        }
    })
}
