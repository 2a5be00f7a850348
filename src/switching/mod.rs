//! C4 — [`ContextSwitchingHandler`]: the switch-out/switch-in protocol for
//! I/O-bound work.
//!
//! "Switch-out" means handing blocking work to the pool and getting back a
//! [`Deferred`] immediately, rather than a pool worker blocking in place.
//! "Switch-in" is the bookkeeping that runs once that work resolves: the
//! suspended [`AsyncContext`](crate::context::AsyncContext) is torn down and
//! the switch counters are updated. Neither step blocks the caller — the
//! whole point of building this on [`Deferred`] instead of a direct call.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::SwitchConfig;
use crate::context::{AsyncContextManager, ContextId, ContextState};
use crate::error::Error;
use crate::future::{self, Deferred};
use crate::pool::AdaptiveThreadPool;
use crate::timer::TimerWheel;
use crate::wire::Request;

/// Everything a switched-out operation needs to know about the request it
/// is running on behalf of.
pub struct SwitchContext {
    pub context_id: ContextId,
    pub request: Arc<Request>,
}

#[derive(Debug, Clone, Default)]
pub struct SwitchStats {
    pub total_switch_outs: u64,
    pub total_switch_ins: u64,
    pub active: usize,
    pub timeouts: u64,
    pub average_switch_ms: f64,
    pub max_concurrent: usize,
    pub default_timeout_ms: u64,
}

impl SwitchStats {
    pub fn timeout_rate(&self) -> f64 {
        if self.total_switch_ins == 0 {
            0.0
        } else {
            self.timeouts as f64 / self.total_switch_ins as f64
        }
    }
}

pub struct ContextSwitchingHandler {
    context_manager: Arc<AsyncContextManager>,
    pool: AdaptiveThreadPool,
    timers: TimerWheel,
    config: SwitchConfig,
    active_switches: Arc<AtomicUsize>,
    total_switch_outs: Arc<AtomicU64>,
    total_switch_ins: Arc<AtomicU64>,
    timeouts: Arc<AtomicU64>,
    cumulative_switch_nanos: Arc<AtomicU64>,
}

impl ContextSwitchingHandler {
    pub fn new(
        context_manager: Arc<AsyncContextManager>,
        pool: AdaptiveThreadPool,
        timers: TimerWheel,
        config: SwitchConfig,
    ) -> Self {
        ContextSwitchingHandler {
            context_manager,
            pool,
            timers,
            config,
            active_switches: Arc::new(AtomicUsize::new(0)),
            total_switch_outs: Arc::new(AtomicU64::new(0)),
            total_switch_ins: Arc::new(AtomicU64::new(0)),
            timeouts: Arc::new(AtomicU64::new(0)),
            cumulative_switch_nanos: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Switches out `operation` against the handler's configured default
    /// timeout.
    pub fn switch_and_execute<F, T>(&self, request: Request, operation: F) -> Deferred<T>
    where
        F: FnOnce(&SwitchContext) -> T + Send + 'static,
        T: Clone + Send + 'static,
    {
        self.switch_and_execute_with_timeout(request, operation, self.config.default_timeout)
    }

    /// Same as [`Self::switch_and_execute`], with an explicit per-call
    /// timeout instead of the configured default.
    pub fn switch_and_execute_with_timeout<F, T>(
        &self,
        request: Request,
        operation: F,
        timeout: Duration,
    ) -> Deferred<T>
    where
        F: FnOnce(&SwitchContext) -> T + Send + 'static,
        T: Clone + Send + 'static,
    {
        self.switch_tagged(request, None, operation, timeout)
    }

    pub fn execute_db<F, T>(&self, request: Request, operation: F) -> Deferred<T>
    where
        F: FnOnce(&SwitchContext) -> T + Send + 'static,
        T: Clone + Send + 'static,
    {
        self.switch_tagged(request, Some("db"), operation, self.config.default_timeout)
    }

    pub fn execute_api<F, T>(&self, request: Request, operation: F) -> Deferred<T>
    where
        F: FnOnce(&SwitchContext) -> T + Send + 'static,
        T: Clone + Send + 'static,
    {
        self.switch_tagged(request, Some("api"), operation, self.config.default_timeout)
    }

    pub fn execute_file<F, T>(&self, request: Request, operation: F) -> Deferred<T>
    where
        F: FnOnce(&SwitchContext) -> T + Send + 'static,
        T: Clone + Send + 'static,
    {
        self.switch_tagged(request, Some("file"), operation, self.config.default_timeout)
    }

    /// Fans `operations` out as independent, concurrent switch-outs, each
    /// suspended under its own context, and joins them preserving order
    /// (Design Notes, Open Question 1) — one operation's failure does not
    /// hide the others' results.
    pub fn execute_multiple<F, T>(
        &self,
        request: Request,
        operations: Vec<F>,
    ) -> Deferred<Vec<Result<T, Error>>>
    where
        F: FnOnce(&SwitchContext) -> T + Send + 'static,
        T: Clone + Send + 'static,
    {
        let branches = operations
            .into_iter()
            .map(|op| self.switch_and_execute(request.clone(), op))
            .collect();
        Deferred::all_of(branches)
    }

    fn switch_tagged<F, T>(
        &self,
        request: Request,
        kind: Option<&'static str>,
        operation: F,
        timeout: Duration,
    ) -> Deferred<T>
    where
        F: FnOnce(&SwitchContext) -> T + Send + 'static,
        T: Clone + Send + 'static,
    {
        if self.active_switches.load(Ordering::SeqCst) >= self.config.max_concurrent_switches {
            return Deferred::ready(Err(Error::TooManySwitches));
        }
        self.active_switches.fetch_add(1, Ordering::SeqCst);
        self.total_switch_outs.fetch_add(1, Ordering::Relaxed);

        let context_id = self.context_manager.create(request.clone());
        if let Some(kind) = kind {
            self.context_manager.set_attribute(&context_id, "switch.kind", kind);
        }
        self.context_manager
            .update_state(&context_id, ContextState::Waiting, Some("switched-out".into()));

        let switch_ctx = SwitchContext {
            context_id: context_id.clone(),
            request: Arc::new(request),
        };
        let op_future = self.pool.submit(move || operation(&switch_ctx), 0).future;

        let (timeout_completer, timeout_future) = future::pending::<T>();
        let timer_handle = self.timers.after(timeout, move || {
            timeout_completer.complete(Err(Error::SwitchTimeout));
        });
        // Cancel the timer once the operation itself completes so it
        // doesn't keep sitting in the wheel until its own deadline.
        let cancel_on_normal_completion = timer_handle.clone();
        op_future.on_complete(move |_| cancel_on_normal_completion.cancel());

        let joined = Deferred::any_of(vec![op_future, timeout_future]);

        let started = Instant::now();
        let manager = self.context_manager.clone();
        let active_switches = self.active_switches.clone();
        let total_switch_ins = self.total_switch_ins.clone();
        let timeouts = self.timeouts.clone();
        let cumulative_switch_nanos = self.cumulative_switch_nanos.clone();

        let (out_completer, out) = future::pending();
        joined.on_complete(move |result| {
            let elapsed = started.elapsed().as_nanos() as u64;
            cumulative_switch_nanos.fetch_add(elapsed, Ordering::Relaxed);
            total_switch_ins.fetch_add(1, Ordering::Relaxed);
            active_switches.fetch_sub(1, Ordering::SeqCst);

            if matches!(&result, Err(Error::SwitchTimeout) | Err(Error::RequestTimeout)) {
                timeouts.fetch_add(1, Ordering::Relaxed);
                manager.update_state(&context_id, ContextState::Timeout, Some("switch timed out".into()));
            }
            manager.remove(&context_id);
            out_completer.complete(result);
        });

        out
    }

    pub fn stats(&self) -> SwitchStats {
        let total_switch_ins = self.total_switch_ins.load(Ordering::Relaxed);
        let cumulative_nanos = self.cumulative_switch_nanos.load(Ordering::Relaxed);
        SwitchStats {
            total_switch_outs: self.total_switch_outs.load(Ordering::Relaxed),
            total_switch_ins,
            active: self.active_switches.load(Ordering::SeqCst),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            average_switch_ms: if total_switch_ins == 0 {
                0.0
            } else {
                (cumulative_nanos as f64 / total_switch_ins as f64) / 1_000_000.0
            },
            max_concurrent: self.config.max_concurrent_switches,
            default_timeout_ms: self.config.default_timeout.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContextManagerConfig, PoolConfig};

    fn sample_request() -> Request {
        Request {
            method: http::Method::GET,
            uri: "/".parse().unwrap(),
            version: http::Version::HTTP_11,
            headers: http::HeaderMap::new(),
            body: bytes::Bytes::new(),
        }
    }

    fn handler(config: SwitchConfig) -> ContextSwitchingHandler {
        let manager = AsyncContextManager::new(ContextManagerConfig::default());
        let pool = AdaptiveThreadPool::new(PoolConfig::default());
        let timers = TimerWheel::new();
        ContextSwitchingHandler::new(manager, pool, timers, config)
    }

    #[test]
    fn switch_and_execute_runs_and_switches_in() {
        let h = handler(SwitchConfig::default());
        let result = h
            .switch_and_execute(sample_request(), |ctx| ctx.request.path().to_string())
            .wait()
            .unwrap();
        assert_eq!(result, "/");
        std::thread::sleep(Duration::from_millis(10));
        let stats = h.stats();
        assert_eq!(stats.total_switch_outs, 1);
        assert_eq!(stats.total_switch_ins, 1);
        assert_eq!(stats.active, 0);
    }

    #[test]
    fn exceeding_max_concurrent_switches_is_rejected_immediately() {
        let h = handler(SwitchConfig {
            max_concurrent_switches: 0,
            default_timeout: Duration::from_secs(1),
        });
        let result: Result<i32, Error> = h.switch_and_execute(sample_request(), |_| 1).wait();
        assert!(matches!(result, Err(Error::TooManySwitches)));
    }

    #[test]
    fn switch_times_out_when_operation_outlives_deadline() {
        let h = handler(SwitchConfig {
            max_concurrent_switches: 10,
            default_timeout: Duration::from_millis(20),
        });
        let result: Result<i32, Error> = h
            .switch_and_execute(sample_request(), |_| {
                std::thread::sleep(Duration::from_millis(200));
                1
            })
            .wait();
        assert!(matches!(result, Err(Error::SwitchTimeout)));
        assert_eq!(h.stats().timeouts, 1);
    }

    #[test]
    fn execute_multiple_preserves_order_across_independent_contexts() {
        let h = handler(SwitchConfig::default());
        let ops: Vec<Box<dyn FnOnce(&SwitchContext) -> i32 + Send>> = vec![
            Box::new(|_: &SwitchContext| 1),
            Box::new(|_: &SwitchContext| 2),
            Box::new(|_: &SwitchContext| 3),
        ];
        let results = h
            .execute_multiple(sample_request(), ops)
            .wait()
            .unwrap()
            .into_iter()
            .map(|r| r.unwrap())
            .collect::<Vec<_>>();
        assert_eq!(results, vec![1, 2, 3]);
    }
}
