use crate::fetcher::reorder::ResultReorderer;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Lightweight rolling counters used to derive runtime metrics.
#[derive(Default, Debug)]
pub struct Telemetry {
    tasks_created: AtomicU64,
    jobs_assigned: AtomicU64,
    retries: AtomicU64,
    bans: AtomicU64,
    timeouts: AtomicU64,
    transport_errors: AtomicU64,
    mismatches: AtomicU64,
    flushed_items: AtomicU64,
    skipped_tasks: AtomicU64,
    stalls: AtomicU64,
}

impl Telemetry {
    pub fn record_tasks_created(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.tasks_created.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_job_assigned(&self) {
        self.jobs_assigned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ban(&self) {
        self.bans.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mismatch(&self) {
        self.mismatches.fetch_add(1, Ordering::Relaxed);
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flushed_items(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.flushed_items.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_skipped_task(&self) {
        self.skipped_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stall(&self) {
        self.stalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            tasks_created: self.tasks_created.load(Ordering::Relaxed),
            jobs_assigned: self.jobs_assigned.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            bans: self.bans.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            mismatches: self.mismatches.load(Ordering::Relaxed),
            flushed_items: self.flushed_items.load(Ordering::Relaxed),
            skipped_tasks: self.skipped_tasks.load(Ordering::Relaxed),
            stalls: self.stalls.load(Ordering::Relaxed),
        }
    }

    pub fn flushed_items(&self) -> u64 {
        self.flushed_items.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn bans(&self) -> u64 {
        self.bans.load(Ordering::Relaxed)
    }

    pub fn stalls(&self) -> u64 {
        self.stalls.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Copy, Clone)]
pub struct TelemetrySnapshot {
    pub tasks_created: u64,
    pub jobs_assigned: u64,
    pub retries: u64,
    pub bans: u64,
    pub timeouts: u64,
    pub transport_errors: u64,
    pub mismatches: u64,
    pub flushed_items: u64,
    pub skipped_tasks: u64,
    pub stalls: u64,
}

/// Spawns a background task that periodically logs throughput, reorder-buffer
/// depth, and failure counters.
pub fn spawn_metrics_reporter<T: Send + 'static>(
    telemetry: Arc<Telemetry>,
    reorderer: Arc<ResultReorderer<T>>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "chainfetch::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current_snapshot = telemetry.snapshot();
                    let flushed_delta = current_snapshot
                        .flushed_items
                        .saturating_sub(last_snapshot.flushed_items);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        flushed_delta as f64 / elapsed
                    };
                    let buffered_tasks = reorderer.len().await;

                    tracing::info!(
                        target: "chainfetch::metrics",
                        throughput = format!("{throughput:.2}"),
                        flushed = current_snapshot.flushed_items,
                        buffered_tasks,
                        in_flight_assignments = current_snapshot.jobs_assigned,
                        retries = current_snapshot.retries,
                        bans = current_snapshot.bans,
                        timeouts = current_snapshot.timeouts,
                        transport_errors = current_snapshot.transport_errors,
                        stalls = current_snapshot.stalls,
                        "runtime metrics snapshot"
                    );

                    last_snapshot = current_snapshot;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
