//! A dedicated single-threaded timer scheduler (Design Notes §9: "do not
//! spawn a one-off OS thread per timer ... a real implementation pools
//! timers"). One background thread services every `after` call in the
//! process via a min-heap of deadlines.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

struct Entry {
    deadline: Instant,
    cancelled: Arc<AtomicBool>,
    fire: Box<dyn FnOnce() + Send>,
}

/// A handle to one scheduled callback, returned by [`TimerWheel::after`].
/// Call [`TimerHandle::cancel`] once the operation it was racing against
/// completes normally, so the callback never fires and the entry is
/// skipped on the timer thread instead of sitting in the heap until its
/// own deadline (§9: "cancel the timer on normal completion").
#[derive(Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Suppresses the scheduled callback if it hasn't already fired.
    /// Racing a cancel against the timer thread popping the same entry
    /// is resolved in favor of whichever side observes it first — a
    /// cancel that loses the race to an already-running callback has no
    /// effect.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

// Ordered by deadline only; BinaryHeap + Reverse gives a min-heap.
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

struct Shared {
    heap: Mutex<BinaryHeap<Reverse<Entry>>>,
    cond: Condvar,
    shutdown: Mutex<bool>,
}

/// A handle to the background timer thread. Cloning shares the same
/// thread; dropping the last handle does not stop the thread (callers
/// are expected to hold one `TimerWheel` for the process lifetime, e.g.
/// inside [`crate::switching::ContextSwitchingHandler`]).
#[derive(Clone)]
pub struct TimerWheel {
    shared: Arc<Shared>,
}

impl TimerWheel {
    /// Spawns the one background thread that services every scheduled
    /// callback for the lifetime of this `TimerWheel`.
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            heap: Mutex::new(BinaryHeap::new()),
            cond: Condvar::new(),
            shutdown: Mutex::new(false),
        });
        let worker_shared = shared.clone();
        thread::Builder::new()
            .name("timer-wheel".to_string())
            .spawn(move || run(worker_shared))
            .expect("spawn timer-wheel thread");
        TimerWheel { shared }
    }

    /// Schedules `fire` to run on the timer thread after `delay`. Returns
    /// a handle the caller can use to cancel it before it fires.
    pub fn after<F>(&self, delay: Duration, fire: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = Entry {
            deadline: Instant::now() + delay,
            cancelled: cancelled.clone(),
            fire: Box::new(fire),
        };
        let mut heap = self.shared.heap.lock().unwrap();
        heap.push(Reverse(entry));
        self.shared.cond.notify_all();
        TimerHandle { cancelled }
    }

    /// Stops the background thread. Pending callbacks that never fired
    /// are dropped without running.
    pub fn shutdown(&self) {
        *self.shared.shutdown.lock().unwrap() = true;
        self.shared.cond.notify_all();
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

fn run(shared: Arc<Shared>) {
    loop {
        let mut heap = shared.heap.lock().unwrap();
        loop {
            if *shared.shutdown.lock().unwrap() {
                return;
            }
            match heap.peek() {
                None => {
                    heap = shared.cond.wait(heap).unwrap();
                }
                Some(Reverse(entry)) => {
                    let now = Instant::now();
                    if entry.deadline <= now {
                        break;
                    }
                    let (guard, _timeout) =
                        shared.cond.wait_timeout(heap, entry.deadline - now).unwrap();
                    heap = guard;
                }
            }
        }
        let Reverse(entry) = heap.pop().unwrap();
        drop(heap);
        if !entry.cancelled.load(Ordering::SeqCst) {
            (entry.fire)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn fires_in_deadline_order() {
        let wheel = TimerWheel::new();
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        wheel.after(Duration::from_millis(40), move || tx2.send("second").unwrap());
        wheel.after(Duration::from_millis(10), move || tx.send("first").unwrap());

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "first");
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "second");
        wheel.shutdown();
    }

    #[test]
    fn cancelled_entry_never_fires() {
        let wheel = TimerWheel::new();
        let (tx, rx) = mpsc::channel();
        let handle = wheel.after(Duration::from_millis(20), move || tx.send(()).unwrap());
        handle.cancel();

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        wheel.shutdown();
    }

    #[test]
    fn cancel_after_firing_is_a_no_op() {
        let wheel = TimerWheel::new();
        let (tx, rx) = mpsc::channel();
        let handle = wheel.after(Duration::from_millis(5), move || tx.send(()).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), ());
        handle.cancel();
        wheel.shutdown();
    }
}
