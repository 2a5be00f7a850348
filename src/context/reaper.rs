//! The background reaper: wakes every `reap_interval`, removes expired
//! contexts. Runs on its own thread rather than blocking `create`/`get` —
//! those only ever touch the `DashMap` directly (§4.2: "must not hold any
//! lock that would block create/get for more than a single-entry
//! duration").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::AsyncContextManager;

pub(crate) struct ReaperHandle {
    stop_flag: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ReaperHandle {
    pub(crate) fn stop(mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

pub(crate) fn spawn(manager: Arc<AsyncContextManager>) -> ReaperHandle {
    let stop_flag = Arc::new(AtomicBool::new(false));
    let worker_stop = stop_flag.clone();
    let join = std::thread::Builder::new()
        .name("async-context-reaper".to_string())
        .spawn(move || {
            while !worker_stop.load(Ordering::SeqCst) {
                std::thread::sleep(manager.reap_interval());
                if worker_stop.load(Ordering::SeqCst) {
                    break;
                }
                let reaped = manager.reap_expired();
                if reaped > 0 {
                    tracing::debug!(reaped, "async-context reaper swept expired contexts");
                }
            }
        })
        .expect("spawn async-context-reaper thread");

    ReaperHandle {
        stop_flag,
        join: Some(join),
    }
}
