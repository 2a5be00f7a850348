//! The worker loop: dequeue highest-priority task, record timing,
//! run it, recycle. A panic inside `task.work` is already caught by
//! [`crate::task::wrap_work`]; this loop only has to survive the
//! dequeue/timing bookkeeping around it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::queue::TaskQueue;
use crate::task::{TaskFate, TickClock};

/// How often an idle worker rechecks its stop flag. Bounds how long a
/// resize-driven shrink takes to actually retire a worker.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub(crate) struct WorkerHandle {
    pub(crate) join: Option<JoinHandle<()>>,
    pub(crate) active: Arc<AtomicBool>,
    pub(crate) stop: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn signal_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub(crate) fn join(mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Spawns one named worker thread (`"{pool_name}-{n}"`). Rust has no
/// daemon-thread concept, so the pool explicitly joins every worker it
/// spawns at shutdown rather than leaking it.
pub(crate) fn spawn(
    name: String,
    queue: Arc<TaskQueue>,
    clock: Arc<TickClock>,
    completed: Arc<AtomicU64>,
    cumulative_execution_nanos: Arc<AtomicU64>,
) -> WorkerHandle {
    let active = Arc::new(AtomicBool::new(false));
    let stop = Arc::new(AtomicBool::new(false));
    let worker_active = active.clone();
    let worker_stop = stop.clone();

    let join = std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            while !worker_stop.load(Ordering::SeqCst) {
                let task = match queue.pop_timeout(POLL_INTERVAL) {
                    Some(task) => task,
                    None => continue,
                };

                worker_active.store(true, Ordering::SeqCst);
                tracing::trace!(worker = %name, priority = task.priority, "before_execute");

                let start_tick = clock.now();
                task.start_tick.store(start_tick, Ordering::Relaxed);
                (task.work)(TaskFate::Run);
                let elapsed = (clock.now() - start_tick).max(0) as u64;

                completed.fetch_add(1, Ordering::Relaxed);
                cumulative_execution_nanos.fetch_add(elapsed, Ordering::Relaxed);
                tracing::trace!(worker = %name, elapsed_ns = elapsed, "after_execute");
                worker_active.store(false, Ordering::SeqCst);
            }
        })
        .expect("spawn pool worker thread");

    WorkerHandle {
        join: Some(join),
        active,
        stop,
    }
}
