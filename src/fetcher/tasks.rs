//! Task generation: splitting a numeric block range into bounded-size tasks,
//! and folding an explicit block-number set into bulk or singleton tasks.

use crate::fetcher::job::JobTask;
use alloy_primitives::U256;
use std::collections::HashSet;

/// Partitions `[first, first + count)` into tasks of at most
/// `max_per_request` items each, in ascending order.
///
/// Every task is full-sized except possibly the last, which carries the
/// remainder. A zero count produces no tasks; a zero-size task is never
/// emitted.
pub fn range_tasks(first: U256, count: U256, max_per_request: usize) -> Vec<JobTask> {
    debug_assert!(max_per_request > 0, "max_per_request must be positive");

    let max = U256::from(max_per_request);
    let mut tasks = Vec::new();
    let mut first = first;
    let mut count = count;

    while count >= max {
        tasks.push(JobTask::new(first, max_per_request));
        first += max;
        count -= max;
    }
    if !count.is_zero() {
        // count < max here, so the remainder fits a usize.
        tasks.push(JobTask::new(first, count.to::<u64>() as usize));
    }

    tasks
}

/// Folds an explicit set of block numbers into tasks.
///
/// If the set is exactly the contiguous run `min..min + len`, one bulk task
/// spans it: one request, one peer round trip. Otherwise each number becomes
/// a singleton task, isolating failures to individual items at the cost of
/// more requests.
pub fn coalesce_numbers(numbers: &[U256], min: U256) -> Vec<JobTask> {
    if numbers.is_empty() {
        return Vec::new();
    }

    let present: HashSet<U256> = numbers.iter().copied().collect();
    let mut expected = min;
    let mut bulk = true;
    for _ in 0..numbers.len() {
        if !present.contains(&expected) {
            bulk = false;
            break;
        }
        expected += U256::from(1);
    }

    if bulk {
        vec![JobTask::new(min, numbers.len())]
    } else {
        numbers
            .iter()
            .map(|first| JobTask::new(*first, 1))
            .collect()
    }
}
