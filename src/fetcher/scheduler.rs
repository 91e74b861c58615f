//! Job scheduling state machine: pending queue, in-flight table, peer
//! selection, and the retry/ban policy.
//!
//! The scheduler performs no I/O and is mutated only by the engine loop that
//! owns it; everything here is synchronous and deterministic, which keeps the
//! retry and assignment rules unit-testable without a runtime.

use crate::fetcher::job::{ActiveJob, JobTask, PendingJob};
use crate::peers::pool::{PeerId, PeerRef};
use crate::peers::reputation::{BanDecision, PeerReputationDump, PeerReputationTracker};
use crate::runtime::config::FetcherConfig;
use crate::transport::TransportError;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

/// A job handed to a peer, ready to be dispatched by the engine.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub index: u64,
    pub task: JobTask,
    pub attempts: u32,
    pub peer: PeerRef,
}

/// How the scheduler classified a peer response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseDisposition {
    /// Shape matches the task; the result may be handed to the reorderer.
    Accepted { task: JobTask },
    /// Item count contradicts the task. The job stays in flight; the caller
    /// must route it through [`JobScheduler::on_failure`].
    Mismatch { expected: usize, actual: usize },
}

/// Resolution of a failed job.
#[derive(Debug, Clone, Copy)]
pub struct FailureReport {
    pub index: u64,
    pub task: JobTask,
    /// Failed attempts consumed so far, including this one.
    pub attempts: u32,
    pub peer: PeerId,
    /// Re-enqueued ahead of fresh work; false means permanent failure.
    pub will_retry: bool,
    /// This failure crossed the peer's ban threshold.
    pub peer_banned: bool,
}

/// Quiescent view of the scheduler, taken when the engine stops.
#[derive(Debug)]
pub struct SchedulerSummary {
    pub pending: usize,
    pub in_flight: usize,
    pub permanently_failed: Vec<u64>,
    pub peers: Vec<PeerReputationDump>,
}

#[derive(Debug)]
pub struct JobScheduler {
    max_in_flight: usize,
    retry_ceiling: u32,
    pending: VecDeque<PendingJob>,
    in_flight: HashMap<u64, ActiveJob>,
    busy_peers: HashSet<PeerId>,
    reputation: PeerReputationTracker,
    permanently_failed: Vec<u64>,
    next_index: u64,
    rr_cursor: usize,
}

impl JobScheduler {
    pub fn new(config: &FetcherConfig) -> Self {
        Self {
            max_in_flight: config.max_in_flight(),
            retry_ceiling: config.retry_ceiling(),
            pending: VecDeque::new(),
            in_flight: HashMap::new(),
            busy_peers: HashSet::new(),
            reputation: PeerReputationTracker::new(
                config.peer_failure_threshold(),
                config.ban_cooldown(),
            ),
            permanently_failed: Vec::new(),
            next_index: 0,
            rr_cursor: 0,
        }
    }

    /// Appends a task with the next generation index.
    pub fn enqueue(&mut self, task: JobTask) -> u64 {
        let index = self.next_index;
        self.next_index += 1;
        self.pending.push_back(PendingJob::new(task, index));
        index
    }

    /// Enqueues a batch. Prioritized tasks are placed ahead of fresh work
    /// while keeping their relative order; indices are assigned in iteration
    /// order either way.
    pub fn enqueue_all(
        &mut self,
        tasks: impl IntoIterator<Item = JobTask>,
        prioritized: bool,
    ) -> usize {
        if !prioritized {
            return tasks.into_iter().map(|task| self.enqueue(task)).count();
        }

        let mut jobs = Vec::new();
        for task in tasks {
            let index = self.next_index;
            self.next_index += 1;
            jobs.push(PendingJob::new(task, index));
        }
        let count = jobs.len();
        for job in jobs.into_iter().rev() {
            self.pending.push_front(job);
        }
        count
    }

    /// Fills the in-flight table: pops pending tasks and binds each to an
    /// eligible peer until the concurrency limit, the queue, or the peer set
    /// is exhausted.
    pub fn next_assignments(&mut self, peers: &[PeerRef], now: Instant) -> Vec<Assignment> {
        let mut out = Vec::new();

        while self.in_flight.len() < self.max_in_flight {
            let Some(job) = self.pending.front().copied() else {
                break;
            };
            let Some(peer) = self.select_peer(peers, job.task.count, now) else {
                break;
            };

            self.pending.pop_front();
            self.busy_peers.insert(peer.id);
            self.in_flight.insert(
                job.index,
                ActiveJob {
                    task: job.task,
                    index: job.index,
                    attempts: job.attempts,
                    peer: peer.id,
                    started: now,
                },
            );
            out.push(Assignment {
                index: job.index,
                task: job.task,
                attempts: job.attempts,
                peer,
            });
        }

        out
    }

    /// Round-robin scan for a peer that is alive, capable of `count` items,
    /// not banned, and not already serving a job.
    fn select_peer(&mut self, peers: &[PeerRef], count: usize, now: Instant) -> Option<PeerRef> {
        if peers.is_empty() {
            return None;
        }
        let start = self.rr_cursor % peers.len();
        for offset in 0..peers.len() {
            let candidate = &peers[(start + offset) % peers.len()];
            if !candidate.can_serve(count) {
                continue;
            }
            if self.busy_peers.contains(&candidate.id) {
                continue;
            }
            if self.reputation.is_banned_at(&candidate.id, now) {
                continue;
            }
            self.rr_cursor = start + offset + 1;
            return Some(candidate.clone());
        }
        None
    }

    /// Classifies a peer response against the job's task.
    ///
    /// `None` means the job is unknown (already resolved or cancelled) and
    /// the response must be dropped. On `Accepted` the job is resolved, the
    /// peer released, and the result may be reordered; on `Mismatch` the job
    /// stays in flight for [`JobScheduler::on_failure`].
    pub fn on_response(&mut self, index: u64, item_count: usize) -> Option<ResponseDisposition> {
        let job = *self.in_flight.get(&index)?;

        if item_count != job.task.count {
            return Some(ResponseDisposition::Mismatch {
                expected: job.task.count,
                actual: item_count,
            });
        }

        self.in_flight.remove(&index);
        self.busy_peers.remove(&job.peer);
        self.reputation.record_success(job.peer);
        Some(ResponseDisposition::Accepted { task: job.task })
    }

    /// Resolves a failed job: releases the peer, charges its reputation, and
    /// either requeues the task prioritized or fails it permanently.
    pub fn on_failure(
        &mut self,
        index: u64,
        error: &TransportError,
        now: Instant,
    ) -> Option<FailureReport> {
        let job = self.in_flight.remove(&index)?;
        self.busy_peers.remove(&job.peer);

        let message = error.to_string();
        let decision = if error.is_mismatch() {
            self.reputation.record_mismatch(job.peer, &message)
        } else {
            self.reputation.record_failure_at(job.peer, &message, now)
        };

        let attempts = job.attempts + 1;
        let will_retry = attempts < self.retry_ceiling;
        if will_retry {
            self.pending.push_front(PendingJob {
                task: job.task,
                index: job.index,
                attempts,
            });
        } else {
            self.permanently_failed.push(job.index);
        }

        Some(FailureReport {
            index: job.index,
            task: job.task,
            attempts,
            peer: job.peer,
            will_retry,
            peer_banned: decision == BanDecision::Banned,
        })
    }

    /// All generated tasks are resolved; nothing pending, nothing in flight.
    pub fn is_done(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn permanently_failed(&self) -> &[u64] {
        &self.permanently_failed
    }

    pub fn reputation_snapshot(&self) -> Vec<PeerReputationDump> {
        self.reputation.snapshot()
    }

    pub fn summary(&self) -> SchedulerSummary {
        SchedulerSummary {
            pending: self.pending.len(),
            in_flight: self.in_flight.len(),
            permanently_failed: self.permanently_failed.clone(),
            peers: self.reputation.snapshot(),
        }
    }
}
