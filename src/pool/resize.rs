//! The adaptive feedback scheduler: wakes every `resize_interval` and
//! asks the pool core to grow or shrink. Mirrors [`crate::context::reaper`]'s
//! shape — a lone named thread, a stop flag, nothing clever.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::Core;

pub(crate) struct ResizeHandle {
    stop_flag: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ResizeHandle {
    pub(crate) fn stop(mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

pub(crate) fn spawn(core: Arc<Core>, name: String) -> ResizeHandle {
    let stop_flag = Arc::new(AtomicBool::new(false));
    let worker_stop = stop_flag.clone();
    let join = std::thread::Builder::new()
        .name(format!("{}-resize", name))
        .spawn(move || {
            while !worker_stop.load(Ordering::SeqCst) {
                std::thread::sleep(core.config.resize_interval);
                if worker_stop.load(Ordering::SeqCst) {
                    break;
                }
                core.resize_tick();
            }
        })
        .expect("spawn pool resize thread");

    ResizeHandle {
        stop_flag,
        join: Some(join),
    }
}
