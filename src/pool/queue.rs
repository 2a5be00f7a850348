//! The bounded priority queue workers dequeue from. A single `Mutex` +
//! `Condvar` pair, matching the systems-language re-expression Design
//! Notes §9 calls for ("a pool owning its queue, worker set, and
//! lifecycle methods") rather than inheriting a library thread-pool.

use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::task::PriorityTask;

pub(crate) struct TaskQueue {
    heap: Mutex<BinaryHeap<PriorityTask>>,
    not_empty: Condvar,
    capacity: usize,
}

pub(crate) enum PushOutcome {
    Queued,
    /// The queue was at capacity; the caller must run the task itself.
    Saturated(PriorityTask),
}

impl TaskQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        TaskQueue {
            heap: Mutex::new(BinaryHeap::new()),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    /// Never blocks longer than queue-insertion time (§4.1): this either
    /// succeeds immediately or reports saturation immediately.
    pub(crate) fn try_push(&self, task: PriorityTask) -> PushOutcome {
        let mut heap = self.heap.lock().unwrap();
        if heap.len() >= self.capacity {
            return PushOutcome::Saturated(task);
        }
        heap.push(task);
        self.not_empty.notify_one();
        PushOutcome::Queued
    }

    /// Waits up to `timeout` for a task. A bounded wait (rather than an
    /// indefinite one) is what lets an individual worker notice its own
    /// stop flag during a resize-driven shrink without every other
    /// worker needing to be woken explicitly.
    pub(crate) fn pop_timeout(&self, timeout: Duration) -> Option<PriorityTask> {
        let mut heap = self.heap.lock().unwrap();
        if let Some(task) = heap.pop() {
            return task.into();
        }
        let (mut heap, _timed_out) = self.not_empty.wait_timeout(heap, timeout).unwrap();
        heap.pop()
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.lock().unwrap().len()
    }

    pub(crate) fn wake_all(&self) {
        self.not_empty.notify_all();
    }

    pub(crate) fn drain(&self) -> Vec<PriorityTask> {
        self.heap.lock().unwrap().drain().collect()
    }
}
