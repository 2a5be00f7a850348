//! C1 — [`PriorityTask`]: a runnable annotated with priority, a monotonic
//! creation tick, and a completion handle.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::future::{Completer, Deferred};

/// A hardware-agnostic high-resolution monotonic tick counter, standing in
/// for spec.md's "monotonic, from a hardware-agnostic high-resolution
/// clock" — an `AtomicI64` fed by `Instant::elapsed` nanoseconds from a
/// fixed process-start epoch, so ticks are plain comparable integers
/// rather than `Instant`s tied to a particular clock source.
pub struct TickClock {
    start: std::time::Instant,
}

impl TickClock {
    pub fn new() -> Self {
        TickClock {
            start: std::time::Instant::now(),
        }
    }

    pub fn now(&self) -> i64 {
        self.start.elapsed().as_nanos() as i64
    }
}

impl Default for TickClock {
    fn default() -> Self {
        Self::new()
    }
}

static CREATION_SEQ: AtomicI64 = AtomicI64::new(0);

/// Whether a [`PriorityTask`]'s boxed work should actually run, or be
/// unwound without running because the pool is shutting down while the
/// task is still queued (its `Completer` still needs to fire either
/// way, or whoever is waiting on the paired `Deferred` hangs forever).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskFate {
    Run,
    Cancel,
}

/// The work a [`PriorityTask`] runs, boxed so the pool's queue can hold
/// heterogeneous jobs.
pub(crate) type BoxedWork = Box<dyn FnOnce(TaskFate) + Send + 'static>;

/// One entry in the pool's priority queue.
///
/// Comparison order: higher `priority` first; ties broken by smaller
/// `created_tick` (FIFO). This is a total order (§8 invariant 5): for any
/// two tasks exactly one of `<`, `>`, `==` holds, because `(priority,
/// created_tick)` is itself a total order on pairs of integers, and
/// `created_tick` is unique per task (drawn from a monotonic counter),
/// making ties on both fields impossible.
pub struct PriorityTask {
    pub(crate) work: BoxedWork,
    pub priority: i32,
    pub created_tick: i64,
    creation_seq: i64,
    pub(crate) start_tick: Arc<AtomicI64>,
}

impl PriorityTask {
    pub fn new(work: BoxedWork, priority: i32, created_tick: i64) -> Self {
        PriorityTask {
            work,
            priority,
            created_tick,
            creation_seq: CREATION_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            start_tick: Arc::new(AtomicI64::new(-1)),
        }
    }

    /// Key used for ordering: `creation_seq` is an infallible tiebreaker
    /// in the (practically impossible, but not forbidden by the clock)
    /// case that two tasks land on the same nanosecond tick.
    fn order_key(&self) -> (i32, i64, i64) {
        (self.priority, -self.created_tick, -self.creation_seq)
    }
}

impl PartialEq for PriorityTask {
    fn eq(&self, other: &Self) -> bool {
        self.order_key() == other.order_key()
    }
}
impl Eq for PriorityTask {}

impl PartialOrd for PriorityTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; order_key is already "bigger is
        // more urgent" (higher priority, then earlier tick/seq), so a
        // plain comparison dequeues the right task first.
        self.order_key().cmp(&other.order_key())
    }
}

/// Wraps `work` so that running it fulfills `completer`, catching a
/// panic the way §7 asks ("uncaught exceptions inside a task must not
/// terminate the worker; they are recorded as task failure on the
/// future"). Recording `start_tick` and the completed-count/cumulative
/// execution-time counters is the pool's job (`pool::worker`), since
/// those are properties of the *slot*, not the task.
pub(crate) fn wrap_work<T, F>(completer: Completer<T>, f: F) -> BoxedWork
where
    F: FnOnce() -> T + Send + 'static,
    T: Clone + Send + 'static,
{
    Box::new(move |fate| match fate {
        TaskFate::Run => {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
            match result {
                Ok(value) => completer.complete(Ok(value)),
                Err(panic) => {
                    let msg = panic_message(&panic);
                    completer.complete(Err(crate::error::Error::HandlerException(msg)));
                }
            }
        }
        TaskFate::Cancel => completer.complete(Err(crate::error::Error::PoolShutDown)),
    })
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

/// The handle a submitter gets back: a future plus the shared
/// `start_tick` cell the worker will populate.
pub struct TaskHandle<T> {
    pub future: Deferred<T>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_task(priority: i32, tick: i64) -> PriorityTask {
        PriorityTask::new(Box::new(|_fate| {}), priority, tick)
    }

    #[test]
    fn total_order_by_priority_then_tick() {
        let a = noop_task(5, 100);
        let b = noop_task(5, 50);
        let c = noop_task(9, 100);

        // b was created earlier than a at equal priority -> b first (bigger key).
        assert!(b > a);
        // c has higher priority -> c first regardless of tick.
        assert!(c > a);
        assert!(c > b);

        // exactly one of <, >, == holds for every pair
        for (x, y) in [(&a, &b), (&a, &c), (&b, &c)] {
            let lt = x < y;
            let gt = x > y;
            let eq = x == y;
            assert_eq!([lt, gt, eq].iter().filter(|v| **v).count(), 1);
        }
    }

    #[test]
    fn binary_heap_pops_highest_priority_first() {
        use std::collections::BinaryHeap;
        let mut heap = BinaryHeap::new();
        heap.push(noop_task(1, 10));
        heap.push(noop_task(9, 20));
        heap.push(noop_task(9, 5));
        heap.push(noop_task(3, 1));

        // highest priority first; among priority 9, smaller tick (5) first
        let first = heap.pop().unwrap();
        assert_eq!(first.priority, 9);
        assert_eq!(first.created_tick, 5);

        let second = heap.pop().unwrap();
        assert_eq!(second.priority, 9);
        assert_eq!(second.created_tick, 20);

        let third = heap.pop().unwrap();
        assert_eq!(third.priority, 3);
    }
}
