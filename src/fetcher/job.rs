use crate::peers::pool::PeerId;
use alloy_primitives::U256;
use std::time::Instant;

/// Immutable unit of fetch work: a contiguous run of `count` items starting
/// at block number `first`.
///
/// `count` is bounded by the configured `max_per_request`, so it fits a
/// machine word even though block numbers themselves do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobTask {
    pub first: U256,
    pub count: usize,
}

impl JobTask {
    pub fn new(first: U256, count: usize) -> Self {
        Self { first, count }
    }

    /// Block number of the last item covered by this task.
    ///
    /// Meaningless for an empty task; generation never emits one.
    pub fn last(&self) -> U256 {
        self.first + U256::from(self.count.saturating_sub(1))
    }

    pub fn is_singleton(&self) -> bool {
        self.count == 1
    }
}

impl core::fmt::Display for JobTask {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[{}; {} items]", self.first, self.count)
    }
}

/// A generated task waiting for peer assignment.
///
/// `index` is the task's position in generation order and the reorder sort
/// key; it never changes across retries. `attempts` counts failed dispatches
/// so far.
#[derive(Debug, Clone, Copy)]
pub struct PendingJob {
    pub task: JobTask,
    pub index: u64,
    pub attempts: u32,
}

impl PendingJob {
    pub fn new(task: JobTask, index: u64) -> Self {
        Self {
            task,
            index,
            attempts: 0,
        }
    }
}

/// A dispatched job, bound to the peer serving it.
#[derive(Debug, Clone, Copy)]
pub struct ActiveJob {
    pub task: JobTask,
    pub index: u64,
    pub attempts: u32,
    pub peer: PeerId,
    pub started: Instant,
}
