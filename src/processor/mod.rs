//! C5 — [`HybridProcessor`]: picks SYNC, ASYNC, or ADAPTIVE dispatch for
//! each request and runs it through the pool accordingly.
//!
//! SYNC blocks the calling thread on the pool's result up to a ceiling.
//! ASYNC allocates an [`AsyncContext`](crate::context::AsyncContext) and
//! returns a [`Deferred`] without blocking. ADAPTIVE is resolved to one of
//! the other two per request, by the decision table in [`Self::resolve_strategy`];
//! it never executes as its own mode.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::config::ProcessorConfig;
use crate::context::{AsyncContextManager, ContextState};
use crate::error::Error;
use crate::future::{self, Deferred};
use crate::pool::AdaptiveThreadPool;
use crate::wire::{Request, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Sync,
    Async,
    Adaptive,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessorStats {
    pub total_requests: u64,
    pub sync_count: u64,
    pub async_count: u64,
    pub adaptive_resolved_sync: u64,
    pub adaptive_resolved_async: u64,
    pub timeouts: u64,
    pub exceptions: u64,
    pub active_requests: usize,
    pub average_latency_ms: f64,
}

pub struct HybridProcessor {
    pool: AdaptiveThreadPool,
    context_manager: Arc<AsyncContextManager>,
    config: ProcessorConfig,
    strategy: Mutex<Strategy>,
    active_requests: Arc<AtomicUsize>,
    total_requests: AtomicU64,
    sync_count: AtomicU64,
    async_count: AtomicU64,
    adaptive_resolved_sync: AtomicU64,
    adaptive_resolved_async: AtomicU64,
    timeouts: Arc<AtomicU64>,
    exceptions: Arc<AtomicU64>,
    average_latency_ms: Mutex<f64>,
}

impl HybridProcessor {
    pub fn new(
        pool: AdaptiveThreadPool,
        context_manager: Arc<AsyncContextManager>,
        config: ProcessorConfig,
    ) -> Self {
        HybridProcessor {
            pool,
            context_manager,
            config,
            strategy: Mutex::new(Strategy::Adaptive),
            active_requests: Arc::new(AtomicUsize::new(0)),
            total_requests: AtomicU64::new(0),
            sync_count: AtomicU64::new(0),
            async_count: AtomicU64::new(0),
            adaptive_resolved_sync: AtomicU64::new(0),
            adaptive_resolved_async: AtomicU64::new(0),
            timeouts: Arc::new(AtomicU64::new(0)),
            exceptions: Arc::new(AtomicU64::new(0)),
            average_latency_ms: Mutex::new(0.0),
        }
    }

    pub fn set_strategy(&self, strategy: Strategy) {
        *self.strategy.lock() = strategy;
    }

    /// Processes `request` at priority 0.
    pub fn process<F>(&self, request: Request, handler: F) -> Deferred<Response>
    where
        F: FnOnce(&Request) -> Response + Send + 'static,
    {
        self.process_with_priority(request, handler, 0)
    }

    /// Processes several requests concurrently, preserving input order.
    pub fn process_batch<F>(&self, items: Vec<(Request, F)>) -> Vec<Deferred<Response>>
    where
        F: FnOnce(&Request) -> Response + Send + 'static,
    {
        items
            .into_iter()
            .map(|(request, handler)| self.process(request, handler))
            .collect()
    }

    /// A priority above `force_sync_priority_above` forces SYNC dispatch
    /// regardless of the active strategy (§4.4: latency-sensitive requests
    /// must not be deferred behind ASYNC bookkeeping).
    pub fn process_with_priority<F>(
        &self,
        request: Request,
        handler: F,
        priority: i32,
    ) -> Deferred<Response>
    where
        F: FnOnce(&Request) -> Response + Send + 'static,
    {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.active_requests.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();

        let strategy = self.resolve_strategy(&request, priority);
        let result = match strategy {
            Strategy::Sync => {
                self.sync_count.fetch_add(1, Ordering::Relaxed);
                self.run_sync(request, handler, priority)
            }
            Strategy::Async => {
                self.async_count.fetch_add(1, Ordering::Relaxed);
                self.run_async(request, handler, priority)
            }
            Strategy::Adaptive => unreachable!("resolve_strategy always picks Sync or Async"),
        };

        let active_requests = self.active_requests.clone();
        result.on_complete(move |_| {
            active_requests.fetch_sub(1, Ordering::SeqCst);
        });
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let mut avg = self.average_latency_ms.lock();
        *avg = 0.9 * *avg + 0.1 * elapsed_ms;
        drop(avg);

        result
    }

    /// §4.4's decision table, resolving ADAPTIVE down to SYNC or ASYNC.
    /// `priority` only matters for the force-sync override; the active
    /// strategy's own `Sync`/`Async` settings bypass the table entirely.
    /// The table's four rows are checked first; a request that falls
    /// through all of them still gets the separate pool-utilization
    /// check from the ADAPTIVE path paragraph before defaulting to SYNC
    /// (Design Notes, Open Question 5).
    fn resolve_strategy(&self, request: &Request, priority: i32) -> Strategy {
        if priority > self.config.force_sync_priority_above {
            return Strategy::Sync;
        }

        match *self.strategy.lock() {
            Strategy::Sync => return Strategy::Sync,
            Strategy::Async => return Strategy::Async,
            Strategy::Adaptive => {}
        }

        if self.config.looks_like_static_asset(request.path()) {
            self.adaptive_resolved_sync.fetch_add(1, Ordering::Relaxed);
            return Strategy::Sync;
        }

        let active = self.active_requests.load(Ordering::SeqCst) as f64;
        let capacity = self.pool.max_size() as f64;
        let pressure = if capacity > 0.0 { active / capacity } else { 0.0 };

        if pressure > self.config.high_concurrency_ratio {
            self.adaptive_resolved_async.fetch_add(1, Ordering::Relaxed);
            return Strategy::Async;
        }

        if self.config.looks_like_api_path(&request.method, request.path()) {
            self.adaptive_resolved_async.fetch_add(1, Ordering::Relaxed);
            return Strategy::Async;
        }

        if pressure > self.config.adaptive_utilization_threshold {
            self.adaptive_resolved_async.fetch_add(1, Ordering::Relaxed);
            Strategy::Async
        } else {
            self.adaptive_resolved_sync.fetch_add(1, Ordering::Relaxed);
            Strategy::Sync
        }
    }

    /// Blocks the calling thread on the pool's result up to
    /// `config.sync_timeout`.
    fn run_sync<F>(&self, request: Request, handler: F, priority: i32) -> Deferred<Response>
    where
        F: FnOnce(&Request) -> Response + Send + 'static,
    {
        let handle = self.pool.submit(move || handler(&request), priority);
        match handle.future.wait_timeout(self.config.sync_timeout) {
            Ok(response) => Deferred::ready(Ok(response)),
            Err(Error::RequestTimeout) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                Deferred::ready(Err(Error::RequestTimeout))
            }
            Err(err @ Error::HandlerException(_)) => {
                self.exceptions.fetch_add(1, Ordering::Relaxed);
                Deferred::ready(Err(err))
            }
            Err(err) => Deferred::ready(Err(err)),
        }
    }

    /// Allocates an `AsyncContext`, submits the work, and returns
    /// immediately; the context is torn down once the pool result lands.
    fn run_async<F>(&self, request: Request, handler: F, priority: i32) -> Deferred<Response>
    where
        F: FnOnce(&Request) -> Response + Send + 'static,
    {
        let context_id = self.context_manager.create(request.clone());
        self.context_manager
            .update_state(&context_id, ContextState::Processing, None);

        let handle = self.pool.submit(move || handler(&request), priority);

        let manager = self.context_manager.clone();
        let exceptions = self.exceptions.clone();
        let (out_completer, out) = future::pending();
        handle.future.on_complete(move |result| {
            match &result {
                Ok(_) => manager.update_state(&context_id, ContextState::Completed, None),
                Err(Error::HandlerException(msg)) => {
                    exceptions.fetch_add(1, Ordering::Relaxed);
                    manager.set_error(&context_id, msg.clone());
                }
                Err(_) => manager.update_state(&context_id, ContextState::Error, None),
            }
            manager.remove(&context_id);
            out_completer.complete(result);
        });

        out
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            sync_count: self.sync_count.load(Ordering::Relaxed),
            async_count: self.async_count.load(Ordering::Relaxed),
            adaptive_resolved_sync: self.adaptive_resolved_sync.load(Ordering::Relaxed),
            adaptive_resolved_async: self.adaptive_resolved_async.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            exceptions: self.exceptions.load(Ordering::Relaxed),
            active_requests: self.active_requests.load(Ordering::SeqCst),
            average_latency_ms: *self.average_latency_ms.lock(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContextManagerConfig, PoolConfig};
    use bytes::Bytes;

    fn sample_request(path: &str, method: http::Method) -> Request {
        Request {
            method,
            uri: path.parse().unwrap(),
            version: http::Version::HTTP_11,
            headers: http::HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    fn processor() -> HybridProcessor {
        let pool = AdaptiveThreadPool::new(PoolConfig::default());
        let manager = AsyncContextManager::new(ContextManagerConfig::default());
        HybridProcessor::new(pool, manager, ProcessorConfig::default())
    }

    #[test]
    fn static_asset_resolves_to_sync_and_runs() {
        let p = processor();
        let response = p
            .process(sample_request("/static/app.css", http::Method::GET), |_| {
                Response::text(http::StatusCode::OK, "body".into())
            })
            .wait()
            .unwrap();
        assert_eq!(response.status, http::StatusCode::OK);
        assert_eq!(p.stats().adaptive_resolved_sync, 1);
    }

    #[test]
    fn api_path_resolves_to_async() {
        let p = processor();
        let response = p
            .process(sample_request("/api/widgets", http::Method::GET), |_| {
                Response::text(http::StatusCode::OK, "ok".into())
            })
            .wait()
            .unwrap();
        assert_eq!(response.status, http::StatusCode::OK);
        assert_eq!(p.stats().adaptive_resolved_async, 1);
    }

    #[test]
    fn forced_strategy_overrides_the_decision_table() {
        let p = processor();
        p.set_strategy(Strategy::Async);
        p.process(sample_request("/static/app.css", http::Method::GET), |_| {
            Response::text(http::StatusCode::OK, "ok".into())
        })
        .wait()
        .unwrap();
        assert_eq!(p.stats().async_count, 1);
        assert_eq!(p.stats().adaptive_resolved_sync, 0);
    }

    #[test]
    fn high_priority_forces_sync_even_under_async_strategy() {
        let p = processor();
        p.set_strategy(Strategy::Async);
        p.process_with_priority(
            sample_request("/anything", http::Method::GET),
            |_| Response::text(http::StatusCode::OK, "ok".into()),
            9,
        )
        .wait()
        .unwrap();
        assert_eq!(p.stats().sync_count, 1);
    }

    #[test]
    fn handler_panic_is_recorded_as_exception() {
        let p = processor();
        p.set_strategy(Strategy::Sync);
        let result = p
            .process(sample_request("/boom", http::Method::GET), |_| {
                panic!("handler blew up")
            })
            .wait();
        assert!(matches!(result, Err(Error::HandlerException(_))));
        assert_eq!(p.stats().exceptions, 1);
    }
}
