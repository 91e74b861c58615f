//! Reassembly buffer: completed jobs arrive in any order and leave strictly
//! in task-generation order.

use std::collections::HashMap;
use tokio::sync::{Mutex, Notify};

enum Slot<T> {
    Ready(Vec<T>),
    /// The task failed permanently under the skip policy; the cursor walks
    /// past it without emitting anything.
    Missing,
}

struct ReorderState<T> {
    next_expected: u64,
    slots: HashMap<u64, Slot<T>>,
    closed: bool,
}

impl<T> ReorderState<T> {
    fn new(next_expected: u64) -> Self {
        Self {
            next_expected,
            slots: HashMap::new(),
            closed: false,
        }
    }
}

/// Buffer that releases job results strictly by ascending task index.
///
/// Capacity is implicit: the scheduler never has more unresolved jobs than
/// its in-flight limit, so at most that many slots wait here at once.
pub struct ResultReorderer<T> {
    state: Mutex<ReorderState<T>>,
    notify: Notify,
}

impl<T> ResultReorderer<T> {
    pub fn new() -> Self {
        Self::with_start(0)
    }

    pub fn with_start(next_expected: u64) -> Self {
        Self {
            state: Mutex::new(ReorderState::new(next_expected)),
            notify: Notify::new(),
        }
    }

    /// Stores the items produced by the job at `index`.
    pub async fn insert(&self, index: u64, items: Vec<T>) {
        let mut state = self.state.lock().await;
        debug_assert!(
            index >= state.next_expected,
            "result for an already-flushed index"
        );
        if index < state.next_expected {
            return;
        }
        state.slots.insert(index, Slot::Ready(items));
        drop(state);
        self.notify.notify_waiters();
    }

    /// Marks `index` as permanently missing so the cursor can advance past it.
    pub async fn mark_missing(&self, index: u64) {
        let mut state = self.state.lock().await;
        if index < state.next_expected {
            return;
        }
        state.slots.insert(index, Slot::Missing);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Removes and returns the contiguous run of ready results starting at
    /// the expected index, flattened into one batch. Empty when the next
    /// expected index has not completed yet.
    pub async fn try_drain(&self) -> Vec<T> {
        let mut state = self.state.lock().await;
        let mut batch = Vec::new();
        loop {
            let next = state.next_expected;
            let Some(slot) = state.slots.remove(&next) else {
                break;
            };
            state.next_expected += 1;
            match slot {
                Slot::Ready(items) => batch.extend(items),
                Slot::Missing => {}
            }
        }
        batch
    }

    /// Waits until an in-order batch is available and returns it.
    ///
    /// Returns `None` once the buffer is closed and nothing further can be
    /// released in order.
    pub async fn pop_ready(&self) -> Option<Vec<T>> {
        loop {
            let notified = self.notify.notified();
            let batch = self.try_drain().await;
            if !batch.is_empty() {
                self.notify.notify_waiters();
                return Some(batch);
            }
            if self.state.lock().await.closed {
                return None;
            }
            notified.await;
        }
    }

    /// Closes the buffer: pending waiters drain whatever is still releasable
    /// in order, then observe the end of the stream.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        drop(state);
        self.notify.notify_waiters();
    }

    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.slots.clear();
        drop(state);
        self.notify.notify_waiters();
    }

    /// Number of tasks buffered out of order.
    pub async fn len(&self) -> usize {
        self.state.lock().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.slots.is_empty()
    }

    pub async fn next_expected(&self) -> u64 {
        self.state.lock().await.next_expected
    }
}

impl<T> Default for ResultReorderer<T> {
    fn default() -> Self {
        Self::new()
    }
}
