//! Fetch pipeline orchestration.
//!
//! `Fetcher` wires the pieces together so each concern is owned by the
//! component that knows it best:
//! - `tasks` turns ranges and number lists into bounded tasks.
//! - `scheduler` owns the pending queue, the in-flight table, peer selection,
//!   and the retry/ban policy.
//! - `reorder` buffers out-of-order completions and releases them strictly by
//!   task index.
//! - `blocks` layers block-specific response validation on top of the generic
//!   engine.
//!
//! The engine itself runs two background tasks per run: a scheduler loop that
//! dispatches jobs to peers and resolves their outcomes, and a flush loop
//! that drains the reorder buffer into the storage sink. A fatal error in
//! either cancels the run token and surfaces when the fetcher is stopped.

pub mod blocks;
pub mod job;
pub mod reorder;
pub mod scheduler;
pub mod tasks;

use crate::fetcher::job::JobTask;
use crate::fetcher::reorder::ResultReorderer;
use crate::fetcher::scheduler::{
    Assignment, FailureReport, JobScheduler, ResponseDisposition, SchedulerSummary,
};
use crate::fetcher::tasks::{coalesce_numbers, range_tasks};
use crate::peers::pool::{PeerId, PeerPool};
use crate::peers::reputation::PeerReputationDump;
use crate::runtime::config::{FailurePolicy, FetcherConfig};
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::telemetry::{self, Telemetry};
use crate::sink::StorageSink;
use crate::transport::{PeerTransport, TransportError};
use alloy_primitives::U256;
use anyhow::{anyhow, bail, Context, Error as AnyError, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Final state of a completed run, returned by [`Fetcher::wait`].
#[derive(Debug, Default)]
pub struct FetchSummary {
    /// Tasks still queued when the run ended (zero on natural completion).
    pub pending_tasks: usize,
    /// Jobs still bound to a peer when the run ended.
    pub in_flight_jobs: usize,
    /// Indices of tasks abandoned after exhausting their retries.
    pub permanently_failed: Vec<u64>,
    /// Reputation state of every peer the scheduler interacted with.
    pub peers: Vec<PeerReputationDump>,
}

impl From<SchedulerSummary> for FetchSummary {
    fn from(summary: SchedulerSummary) -> Self {
        Self {
            pending_tasks: summary.pending,
            in_flight_jobs: summary.in_flight,
            permanently_failed: summary.permanently_failed,
            peers: summary.peers,
        }
    }
}

enum ControlCommand {
    Enqueue {
        tasks: Vec<JobTask>,
        prioritized: bool,
    },
}

struct JobEvent<T> {
    index: u64,
    peer: PeerId,
    outcome: Result<Vec<T>, TransportError>,
}

/// Run-scoped handles: per-run cancellation, fatal error capture, and the
/// metrics reporter.
struct LifecycleHandles {
    run_token: CancellationToken,
    fatal_handler: FatalErrorHandler,
    metrics_handle: Option<JoinHandle<()>>,
}

impl LifecycleHandles {
    fn spawn<T: Send + 'static>(
        shutdown_root: &CancellationToken,
        telemetry: Arc<Telemetry>,
        reorderer: Arc<ResultReorderer<T>>,
        metrics_interval: Duration,
    ) -> Self {
        let run_token = shutdown_root.child_token();
        let fatal_handler = FatalErrorHandler::new(shutdown_root.clone(), run_token.clone());
        let metrics_handle = telemetry::spawn_metrics_reporter(
            telemetry,
            reorderer,
            run_token.clone(),
            metrics_interval,
        );

        Self {
            run_token,
            fatal_handler,
            metrics_handle: Some(metrics_handle),
        }
    }

    fn error(&self) -> Option<AnyError> {
        self.fatal_handler.error()
    }

    async fn shutdown(mut self) {
        if let Some(handle) = self.metrics_handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "metrics reporter task panicked");
            }
        }
    }
}

/// Generic peer-distributed fetch engine.
///
/// Tasks are generated in order, fanned out over the peer set bounded by the
/// in-flight limit, and reassembled into strictly ordered batches handed to
/// the [`StorageSink`]. See [`blocks::BlockFetcher`] for the block-sync
/// specialization most callers want.
pub struct Fetcher<X, S, P>
where
    X: PeerTransport,
    S: StorageSink<Item = X::Item>,
    P: PeerPool,
{
    config: FetcherConfig,
    transport: Arc<X>,
    sink: Arc<Mutex<S>>,
    pool: Arc<P>,
    reorderer: Arc<ResultReorderer<X::Item>>,
    telemetry: Arc<Telemetry>,
    shutdown_root: CancellationToken,
    running: bool,
    control_tx: Option<mpsc::Sender<ControlCommand>>,
    scheduler_handle: Option<JoinHandle<SchedulerSummary>>,
    flush_handle: Option<JoinHandle<Result<()>>>,
    lifecycle: Option<LifecycleHandles>,
}

impl<X, S, P> Fetcher<X, S, P>
where
    X: PeerTransport,
    S: StorageSink<Item = X::Item>,
    P: PeerPool,
{
    /// Creates a fetcher with its own root cancellation token. Use
    /// [`Self::with_cancellation_token`] to integrate with an existing
    /// shutdown mechanism.
    pub fn new(config: FetcherConfig, transport: X, sink: S, pool: P) -> Self {
        Self::with_cancellation_token(config, transport, sink, pool, CancellationToken::new())
    }

    /// Creates a fetcher whose per-run cancellation tokens derive from
    /// `shutdown_token`.
    pub fn with_cancellation_token(
        config: FetcherConfig,
        transport: X,
        sink: S,
        pool: P,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            config,
            transport: Arc::new(transport),
            sink: Arc::new(Mutex::new(sink)),
            pool: Arc::new(pool),
            reorderer: Arc::new(ResultReorderer::new()),
            telemetry: Arc::new(Telemetry::default()),
            shutdown_root: shutdown_token,
            running: false,
            control_tx: None,
            scheduler_handle: None,
            flush_handle: None,
            lifecycle: None,
        }
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    /// Returns a clone of the telemetry handle for observability.
    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Replaces the root shutdown token used to derive per-run cancellation
    /// tokens. Must only be called while the fetcher is idle.
    pub fn replace_shutdown_root(&mut self, shutdown: CancellationToken) {
        debug_assert!(
            !self.running,
            "shutdown token should not change while the fetcher is running"
        );
        self.shutdown_root = shutdown;
    }

    /// Starts the scheduler and flush loops. Tasks are supplied afterwards
    /// via [`Self::enqueue_range`], [`Self::enqueue_numbers`], or
    /// [`Self::enqueue_tasks`].
    ///
    /// Returns an error if the fetcher is already running.
    pub async fn start(&mut self) -> Result<()> {
        if self.running {
            bail!("fetcher already running");
        }

        debug_assert!(
            self.config.validate().is_ok(),
            "FetcherConfig should have been validated at construction time"
        );

        tracing::info!(
            max_in_flight = self.config.max_in_flight(),
            max_per_request = self.config.max_per_request(),
            retry_ceiling = self.config.retry_ceiling(),
            "starting fetcher"
        );

        // Fresh reorder buffer per run; indices restart at zero.
        self.reorderer = Arc::new(ResultReorderer::new());

        let lifecycle = LifecycleHandles::spawn(
            &self.shutdown_root,
            self.telemetry.clone(),
            self.reorderer.clone(),
            self.config.metrics_interval(),
        );
        let run_token = lifecycle.run_token.clone();
        let fatal_handler = lifecycle.fatal_handler.clone();

        let (control_tx, control_rx) = mpsc::channel(16);

        let scheduler_loop = SchedulerLoop {
            config: self.config.clone(),
            transport: self.transport.clone(),
            pool: self.pool.clone(),
            reorderer: self.reorderer.clone(),
            telemetry: self.telemetry.clone(),
            fatal_handler: fatal_handler.clone(),
            run_token: run_token.clone(),
        };
        self.scheduler_handle = Some(tokio::spawn(scheduler_loop.run(control_rx)));
        self.flush_handle = Some(Self::spawn_flush_loop(
            self.reorderer.clone(),
            self.sink.clone(),
            self.telemetry.clone(),
            fatal_handler,
            run_token,
        ));
        self.control_tx = Some(control_tx);
        self.lifecycle = Some(lifecycle);
        self.running = true;

        Ok(())
    }

    /// Submits pre-built tasks to the running scheduler. Prioritized tasks
    /// are placed ahead of fresh work, keeping their relative order.
    ///
    /// An empty list is still delivered: it counts as a submission, so a run
    /// whose every enqueue produced zero tasks can complete instead of
    /// waiting for work forever.
    pub async fn enqueue_tasks(&self, tasks: Vec<JobTask>, prioritized: bool) -> Result<usize> {
        let count = tasks.len();
        let Some(control_tx) = &self.control_tx else {
            bail!("fetcher is not running");
        };
        control_tx
            .send(ControlCommand::Enqueue { tasks, prioritized })
            .await
            .map_err(|_| anyhow!("fetcher control channel closed"))?;
        Ok(count)
    }

    /// Splits `[first, first + count)` into bounded tasks and enqueues them.
    /// Returns the number of tasks generated.
    pub async fn enqueue_range(&self, first: U256, count: U256) -> Result<usize> {
        let tasks = range_tasks(first, count, self.config.max_per_request());
        self.enqueue_tasks(tasks, false).await
    }

    /// Folds an explicit block-number set into tasks and enqueues them ahead
    /// of fresh work (number lists are typically refetches of missing or bad
    /// items).
    ///
    /// A contiguous set becomes bulk tasks (split at the per-request limit);
    /// a gapped set becomes singleton tasks.
    pub async fn enqueue_numbers(&self, numbers: &[U256], min: U256) -> Result<usize> {
        let max = self.config.max_per_request();
        let coalesced = coalesce_numbers(numbers, min);
        let bulk = coalesced.len() == 1 && !coalesced[0].is_singleton();
        let tasks: Vec<JobTask> = coalesced
            .into_iter()
            .flat_map(|task| {
                if task.count > max {
                    range_tasks(task.first, U256::from(task.count as u64), max)
                } else {
                    vec![task]
                }
            })
            .collect();
        tracing::debug!(
            numbers = numbers.len(),
            tasks = tasks.len(),
            bulk,
            min = %min,
            "enqueueing block-number list"
        );
        self.enqueue_tasks(tasks, true).await
    }

    /// Blocks until the run terminates and returns its final state.
    ///
    /// With `destroy_when_done` set, the run terminates naturally once every
    /// generated task is resolved and all results are flushed; otherwise it
    /// terminates when cancelled or on fatal error.
    pub async fn wait(&mut self) -> Result<FetchSummary> {
        if !self.running {
            bail!("fetcher is not running");
        }
        self.finish().await
    }

    /// Stops the pipeline: cancels the run, joins both loops, and invokes the
    /// sink's shutdown hook. Buffered but unflushed results are dropped.
    ///
    /// Surfaces any fatal error captured during the run.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }

        tracing::info!("stopping fetcher");
        if let Some(lifecycle) = &self.lifecycle {
            lifecycle.run_token.cancel();
        }
        self.finish().await.map(drop)
    }

    async fn finish(&mut self) -> Result<FetchSummary> {
        self.control_tx = None;

        let mut pipeline_error: Option<AnyError> = None;
        let mut summary = FetchSummary::default();
        if let Some(handle) = self.scheduler_handle.take() {
            match handle.await {
                Ok(scheduler_summary) => summary = scheduler_summary.into(),
                Err(err) => {
                    tracing::error!(error = %err, "failed to join scheduler loop task");
                    pipeline_error = Some(err.into());
                }
            }
        }
        tracing::debug!("fetcher finish: scheduler loop joined");

        // Wakes the flush task if the run ended before natural completion.
        self.reorderer.close().await;

        if let Some(handle) = self.flush_handle.take() {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!(error = %err, "flush loop exited with error");
                    pipeline_error.get_or_insert(err);
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to join flush loop task");
                    pipeline_error.get_or_insert(err.into());
                }
            }
        }
        tracing::debug!("fetcher finish: flush loop joined");

        // Read the fatal error only after both loops have been joined; a
        // fatal raised while they were still winding down must not be lost.
        let mut lifecycle_error = None;
        if let Some(lifecycle) = self.lifecycle.take() {
            lifecycle.run_token.cancel();
            lifecycle_error = lifecycle.error();
            lifecycle.shutdown().await;
        }

        {
            let mut sink = self.sink.lock().await;
            sink.shutdown()
                .await
                .map_err(AnyError::from)
                .context("failed to shut down sink")?;
        }

        self.reorderer.clear().await;
        self.running = false;

        if let Some(err) = pipeline_error.or(lifecycle_error) {
            return Err(err).context("fetch pipeline aborted");
        }

        tracing::info!(
            pending = summary.pending_tasks,
            failed = summary.permanently_failed.len(),
            "fetcher stopped"
        );
        Ok(summary)
    }

    fn spawn_flush_loop(
        reorderer: Arc<ResultReorderer<X::Item>>,
        sink: Arc<Mutex<S>>,
        telemetry: Arc<Telemetry>,
        fatal_handler: FatalErrorHandler,
        run_token: CancellationToken,
    ) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = run_token.cancelled() => {
                        let buffered = reorderer.len().await;
                        if buffered > 0 {
                            tracing::info!(
                                buffered_tasks = buffered,
                                "flush loop cancelled; dropping buffered results"
                            );
                        }
                        return Ok(());
                    }
                    batch = reorderer.pop_ready() => {
                        let Some(items) = batch else {
                            tracing::debug!("reorder buffer closed; flush loop stopping");
                            return Ok(());
                        };
                        let count = items.len() as u64;
                        let flush_result = {
                            let mut sink = sink.lock().await;
                            sink.flush(items).await
                        };
                        if let Err(err) = flush_result {
                            return Err(fatal_handler.trigger(err));
                        }
                        telemetry.record_flushed_items(count);
                        tracing::trace!(items = count, "flushed ordered batch");
                    }
                }
            }
        })
    }
}

/// Owns the scheduler state machine for one run and drives dispatching,
/// outcome resolution, and stall backoff.
struct SchedulerLoop<X, P>
where
    X: PeerTransport,
    P: PeerPool,
{
    config: FetcherConfig,
    transport: Arc<X>,
    pool: Arc<P>,
    reorderer: Arc<ResultReorderer<X::Item>>,
    telemetry: Arc<Telemetry>,
    fatal_handler: FatalErrorHandler,
    run_token: CancellationToken,
}

impl<X, P> SchedulerLoop<X, P>
where
    X: PeerTransport,
    P: PeerPool,
{
    async fn run(self, mut control_rx: mpsc::Receiver<ControlCommand>) -> SchedulerSummary {
        let mut scheduler = JobScheduler::new(&self.config);
        let event_capacity = self.config.max_in_flight().saturating_mul(2).max(8);
        let (event_tx, mut event_rx) = mpsc::channel::<JobEvent<X::Item>>(event_capacity);

        let mut total_enqueued: u64 = 0;
        let mut saw_enqueue = false;
        let mut control_closed = false;
        let mut backoff = self.config.stall_backoff_initial();

        loop {
            if self.run_token.is_cancelled() {
                tracing::debug!("scheduler loop received shutdown signal");
                break;
            }

            if self.config.destroy_when_done() && saw_enqueue && scheduler.is_done() {
                // Drain any enqueue that raced with completion before
                // declaring the run finished.
                match control_rx.try_recv() {
                    Ok(command) => {
                        total_enqueued += self.handle_command(&mut scheduler, command) as u64;
                        continue;
                    }
                    Err(_) => {
                        tracing::info!(
                            tasks = total_enqueued,
                            failed = scheduler.permanently_failed().len(),
                            "all tasks resolved; scheduler loop stopping"
                        );
                        self.reorderer.close().await;
                        break;
                    }
                }
            }

            let peers = self.pool.list_available();
            let assignments = scheduler.next_assignments(&peers, Instant::now());
            // Saturation is not a stall: with jobs in flight their outcomes
            // drive the loop forward. Only a starved loop needs the timer.
            let stalled = assignments.is_empty()
                && scheduler.pending_count() > 0
                && scheduler.in_flight_count() == 0;
            if !assignments.is_empty() {
                backoff = self.config.stall_backoff_initial();
            }
            for assignment in assignments {
                self.dispatch(assignment, event_tx.clone());
            }

            tokio::select! {
                _ = self.run_token.cancelled() => {
                    tracing::debug!("scheduler loop received shutdown signal");
                    break;
                }
                command = control_rx.recv(), if !control_closed => {
                    match command {
                        Some(command) => {
                            total_enqueued += self.handle_command(&mut scheduler, command) as u64;
                            saw_enqueue = true;
                            backoff = self.config.stall_backoff_initial();
                        }
                        None => control_closed = true,
                    }
                }
                event = event_rx.recv() => {
                    // The loop holds `event_tx`, so the channel cannot close.
                    if let Some(event) = event {
                        self.handle_event(&mut scheduler, event).await;
                        backoff = self.config.stall_backoff_initial();
                    }
                }
                _ = time::sleep(backoff), if stalled => {
                    self.telemetry.record_stall();
                    tracing::warn!(
                        pending = scheduler.pending_count(),
                        in_flight = scheduler.in_flight_count(),
                        available_peers = peers.len(),
                        backoff_ms = backoff.as_millis() as u64,
                        "no eligible peer for pending tasks; backing off"
                    );
                    backoff = backoff
                        .saturating_mul(2)
                        .min(self.config.stall_backoff_max());
                }
            }
        }

        scheduler.summary()
    }

    fn handle_command(&self, scheduler: &mut JobScheduler, command: ControlCommand) -> usize {
        match command {
            ControlCommand::Enqueue { tasks, prioritized } => {
                let count = scheduler.enqueue_all(tasks, prioritized);
                self.telemetry.record_tasks_created(count as u64);
                tracing::debug!(tasks = count, prioritized, "tasks enqueued");
                count
            }
        }
    }

    fn dispatch(&self, assignment: Assignment, event_tx: mpsc::Sender<JobEvent<X::Item>>) {
        self.telemetry.record_job_assigned();
        tracing::trace!(
            index = assignment.index,
            task = %assignment.task,
            peer = %assignment.peer.id,
            attempts = assignment.attempts,
            "job dispatched"
        );

        let transport = self.transport.clone();
        let run_token = self.run_token.clone();
        let request_timeout = self.config.request_timeout();
        tokio::spawn(async move {
            let request = transport.request(&assignment.peer, &assignment.task);
            let outcome = tokio::select! {
                _ = run_token.cancelled() => return,
                result = time::timeout(request_timeout, request) => match result {
                    Ok(outcome) => outcome,
                    Err(_) => Err(TransportError::Timeout),
                },
            };
            let _ = event_tx
                .send(JobEvent {
                    index: assignment.index,
                    peer: assignment.peer.id,
                    outcome,
                })
                .await;
        });
    }

    async fn handle_event(&self, scheduler: &mut JobScheduler, event: JobEvent<X::Item>) {
        match event.outcome {
            Ok(items) => match scheduler.on_response(event.index, items.len()) {
                Some(ResponseDisposition::Accepted { .. }) => {
                    tracing::trace!(
                        index = event.index,
                        items = items.len(),
                        peer = %event.peer,
                        "job completed"
                    );
                    self.reorderer.insert(event.index, items).await;
                }
                Some(ResponseDisposition::Mismatch { expected, actual }) => {
                    let error = TransportError::Malformed(format!(
                        "expected {expected} items, got {actual}"
                    ));
                    self.resolve_failure(scheduler, event.index, &event.peer, error)
                        .await;
                }
                None => {
                    tracing::trace!(index = event.index, "dropping response for resolved job");
                }
            },
            Err(error) => {
                self.resolve_failure(scheduler, event.index, &event.peer, error)
                    .await;
            }
        }
    }

    async fn resolve_failure(
        &self,
        scheduler: &mut JobScheduler,
        index: u64,
        peer: &PeerId,
        error: TransportError,
    ) {
        match &error {
            TransportError::Timeout => self.telemetry.record_timeout(),
            TransportError::Malformed(_) => self.telemetry.record_mismatch(),
            _ => self.telemetry.record_transport_error(),
        }

        let Some(report) = scheduler.on_failure(index, &error, Instant::now()) else {
            tracing::trace!(index, "dropping failure for resolved job");
            return;
        };

        tracing::debug!(
            index,
            task = %report.task,
            peer = %peer,
            attempts = report.attempts,
            kind = error.kind(),
            error = %error,
            "job failed"
        );

        if report.peer_banned {
            self.telemetry.record_ban();
            self.pool.ban(report.peer, self.config.ban_cooldown());
            tracing::warn!(
                peer = %report.peer,
                cooldown_secs = self.config.ban_cooldown().as_secs(),
                "peer banned after repeated failures"
            );
        }

        if report.will_retry {
            self.telemetry.record_retry();
            return;
        }

        self.handle_permanent_failure(&report, &error).await;
    }

    async fn handle_permanent_failure(&self, report: &FailureReport, error: &TransportError) {
        match self.config.failure_policy() {
            FailurePolicy::Abort => {
                let err = anyhow!(
                    "task {} failed after {} attempts: {error}",
                    report.task,
                    report.attempts
                );
                let _ = self
                    .fatal_handler
                    .trigger_external("task retries exhausted", err);
            }
            FailurePolicy::Skip => {
                self.telemetry.record_skipped_task();
                self.reorderer.mark_missing(report.index).await;
                tracing::warn!(
                    index = report.index,
                    task = %report.task,
                    attempts = report.attempts,
                    "task abandoned after retry ceiling; leaving a hole in the output"
                );
            }
        }
    }
}
