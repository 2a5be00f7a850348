//! C8 — [`HandlerContainer`]: registers handlers by URL pattern, pools
//! their instances, and bridges sync/async handler bodies into the
//! [`crate::processor::HybridProcessor`] (sync) or directly through a
//! shared [`ResponseBuilder`] (async).

mod pool;
pub mod router;
mod response;

pub use response::ResponseBuilder;
pub use router::{PatternRouter, Router};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex as PLMutex, RwLock};

use crate::error::Error;
use crate::future::{self, Deferred};
use crate::processor::HybridProcessor;
use crate::task::panic_message;
use crate::wire::{Request, Response};
use pool::{DestroyInstance, InstancePool};

/// Process-wide context handed to every handler's `init` hook.
#[derive(Debug, Clone, Default)]
pub struct GlobalContext {
    pub server_name: String,
}

pub trait SyncHandler: Send {
    fn init(&mut self, _global: &GlobalContext) {}
    fn service(&mut self, request: &Request, response: &mut ResponseBuilder) -> Response;
    fn destroy(&mut self) {}
}

pub trait AsyncHandler: Send {
    fn init(&mut self, _global: &GlobalContext) {}
    /// Populates `response` (shared so the handler can finish writing to it
    /// from wherever the returned future actually resolves) and returns a
    /// `Deferred<()>` that completes once that population is done.
    fn service_async(
        &mut self,
        request: &Request,
        response: Arc<PLMutex<ResponseBuilder>>,
    ) -> Deferred<()>;
    fn destroy(&mut self) {}
}

impl DestroyInstance for Box<dyn SyncHandler> {
    fn destroy_instance(&mut self) {
        self.as_mut().destroy();
    }
}

impl DestroyInstance for Box<dyn AsyncHandler> {
    fn destroy_instance(&mut self) {
        self.as_mut().destroy();
    }
}

enum Entry {
    Sync(InstancePool<Box<dyn SyncHandler>>),
    Async(InstancePool<Box<dyn AsyncHandler>>),
}

struct Registered {
    entry: Entry,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerStats {
    pub not_found: u64,
    pub exceptions: u64,
    pub sync_dispatches: u64,
    pub async_dispatches: u64,
}

pub struct HandlerContainer {
    global: GlobalContext,
    router: Box<dyn Router>,
    handlers: RwLock<HashMap<String, Arc<Registered>>>,
    processor: Arc<HybridProcessor>,
    pool_max: usize,
    pool_prewarm: usize,
    not_found: AtomicU64,
    exceptions: Arc<AtomicU64>,
    sync_dispatches: AtomicU64,
    async_dispatches: AtomicU64,
}

impl HandlerContainer {
    pub fn new(
        global: GlobalContext,
        processor: Arc<HybridProcessor>,
        pool_max: usize,
        pool_prewarm: usize,
    ) -> Self {
        HandlerContainer {
            global,
            router: Box::new(PatternRouter::new()),
            handlers: RwLock::new(HashMap::new()),
            processor,
            pool_max,
            pool_prewarm,
            not_found: AtomicU64::new(0),
            exceptions: Arc::new(AtomicU64::new(0)),
            sync_dispatches: AtomicU64::new(0),
            async_dispatches: AtomicU64::new(0),
        }
    }

    /// Swaps in an alternate `Router` implementation (C9 is an external
    /// collaborator contract; [`PatternRouter`] is just the default). Must
    /// be called before registering any handler, since handlers register
    /// their own patterns through the router in place at registration time.
    pub fn with_router(mut self, router: Box<dyn Router>) -> Self {
        self.router = router;
        self
    }

    /// Registers a synchronous handler, building the prewarm pool from
    /// `factory` and mapping every pattern in `patterns` to `name`.
    pub fn register_sync<F>(&self, name: &str, patterns: &[&str], factory: F)
    where
        F: Fn() -> Box<dyn SyncHandler> + Send + Sync + 'static,
    {
        let global = self.global.clone();
        let pool = InstancePool::new(self.pool_max, self.pool_prewarm, move || {
            let mut instance = factory();
            instance.init(&global);
            instance
        });
        self.handlers.write().insert(
            name.to_string(),
            Arc::new(Registered {
                entry: Entry::Sync(pool),
            }),
        );
        self.register_patterns(name, patterns);
    }

    pub fn register_async<F>(&self, name: &str, patterns: &[&str], factory: F)
    where
        F: Fn() -> Box<dyn AsyncHandler> + Send + Sync + 'static,
    {
        let global = self.global.clone();
        let pool = InstancePool::new(self.pool_max, self.pool_prewarm, move || {
            let mut instance = factory();
            instance.init(&global);
            instance
        });
        self.handlers.write().insert(
            name.to_string(),
            Arc::new(Registered {
                entry: Entry::Async(pool),
            }),
        );
        self.register_patterns(name, patterns);
    }

    fn register_patterns(&self, name: &str, patterns: &[&str]) {
        for pattern in patterns {
            self.router.register(pattern, name);
        }
    }

    /// Routes `request`, then dispatches it through whichever handler
    /// variant is registered. No match becomes `404 Not Found` (§4.7),
    /// routed through `Error::NoRoute` so the failure is observable
    /// through `kind_label`/stats like any other error (§7).
    pub fn dispatch(&self, request: Request) -> Deferred<Response> {
        let name = match self.router.route(&request.method, request.path()) {
            Some(name) => name,
            None => return self.no_route(&request),
        };

        let registered = match self.handlers.read().get(&name).cloned() {
            Some(registered) => registered,
            None => return self.no_route(&request),
        };

        match &registered.entry {
            Entry::Sync(_) => {
                self.sync_dispatches.fetch_add(1, Ordering::Relaxed);
                self.dispatch_sync(registered, request)
            }
            Entry::Async(_) => {
                self.async_dispatches.fetch_add(1, Ordering::Relaxed);
                self.dispatch_async(registered, request)
            }
        }
    }

    fn no_route(&self, request: &Request) -> Deferred<Response> {
        self.not_found.fetch_add(1, Ordering::Relaxed);
        let err = Error::NoRoute(request.path().to_string());
        tracing::warn!(kind = crate::error::kind_label(&err), path = request.path(), "no route matched");
        Deferred::ready(Ok(Response::text(err.status_code(), "Not Found")))
    }

    fn dispatch_sync(&self, registered: Arc<Registered>, request: Request) -> Deferred<Response> {
        let mut instance = match &registered.entry {
            Entry::Sync(pool) => pool.acquire(),
            Entry::Async(_) => unreachable!("dispatch_sync called on an async entry"),
        };
        let exceptions_counter = self.exceptions.clone();

        self.processor.process(request, move |req| {
            let mut builder = ResponseBuilder::new();
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                instance.service(req, &mut builder)
            }));
            let response = match outcome {
                Ok(response) => response,
                Err(panic) => {
                    exceptions_counter.fetch_add(1, Ordering::Relaxed);
                    let message = panic_message(&panic);
                    tracing::error!(error = %message, "sync handler panicked");
                    Response::internal_error(message)
                }
            };
            match &registered.entry {
                Entry::Sync(pool) => pool.release(instance),
                Entry::Async(_) => unreachable!(),
            }
            response
        })
    }

    fn dispatch_async(&self, registered: Arc<Registered>, request: Request) -> Deferred<Response> {
        let mut instance = match &registered.entry {
            Entry::Async(pool) => pool.acquire(),
            Entry::Sync(_) => unreachable!("dispatch_async called on a sync entry"),
        };

        let builder = Arc::new(PLMutex::new(ResponseBuilder::new()));
        let void_future = instance.service_async(&request, builder.clone());

        let exceptions_counter = self.exceptions.clone();
        let (out_completer, out) = future::pending();

        void_future.on_complete(move |result| {
            let response = match result {
                Ok(()) => builder.lock().build(),
                Err(err) => {
                    exceptions_counter.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        kind = crate::error::kind_label(&err),
                        error = %err,
                        "async handler failed"
                    );
                    Response::internal_error(err.to_string())
                }
            };
            match &registered.entry {
                Entry::Async(pool) => pool.release(instance),
                Entry::Sync(_) => unreachable!(),
            }
            out_completer.complete(Ok(response));
        });

        out
    }

    pub fn stats(&self) -> ContainerStats {
        ContainerStats {
            not_found: self.not_found.load(Ordering::Relaxed),
            exceptions: self.exceptions.load(Ordering::Relaxed),
            sync_dispatches: self.sync_dispatches.load(Ordering::Relaxed),
            async_dispatches: self.async_dispatches.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContextManagerConfig, PoolConfig, ProcessorConfig};
    use crate::context::AsyncContextManager;
    use crate::pool::AdaptiveThreadPool;
    use bytes::Bytes;

    struct EchoHandler;
    impl SyncHandler for EchoHandler {
        fn service(&mut self, _request: &Request, response: &mut ResponseBuilder) -> Response {
            response.write_string("echo");
            response.build()
        }
    }

    struct PanickingHandler;
    impl SyncHandler for PanickingHandler {
        fn service(&mut self, _request: &Request, _response: &mut ResponseBuilder) -> Response {
            panic!("handler exploded");
        }
    }

    struct DeferredHandler;
    impl AsyncHandler for DeferredHandler {
        fn service_async(
            &mut self,
            _request: &Request,
            response: Arc<PLMutex<ResponseBuilder>>,
        ) -> Deferred<()> {
            response.lock().write_string("async echo");
            Deferred::ready(Ok(()))
        }
    }

    fn sample_request(path: &str) -> Request {
        Request {
            method: http::Method::GET,
            uri: path.parse().unwrap(),
            version: http::Version::HTTP_11,
            headers: http::HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    fn container() -> HandlerContainer {
        let pool = AdaptiveThreadPool::new(PoolConfig::default());
        let manager = AsyncContextManager::new(ContextManagerConfig::default());
        let processor = Arc::new(HybridProcessor::new(pool, manager, ProcessorConfig::default()));
        HandlerContainer::new(GlobalContext::default(), processor, 4, 1)
    }

    #[test]
    fn dispatches_to_registered_sync_handler() {
        let container = container();
        container.register_sync("echo", &["/echo"], || Box::new(EchoHandler));
        let response = container.dispatch(sample_request("/echo")).wait().unwrap();
        assert_eq!(response.body, Bytes::from_static(b"echo"));
        assert_eq!(container.stats().sync_dispatches, 1);
    }

    #[test]
    fn unmatched_path_is_404_without_touching_any_handler() {
        let container = container();
        container.register_sync("echo", &["/echo"], || Box::new(EchoHandler));
        let response = container.dispatch(sample_request("/nope")).wait().unwrap();
        assert_eq!(response.status, http::StatusCode::NOT_FOUND);
        assert_eq!(container.stats().not_found, 1);
    }

    #[test]
    fn panicking_sync_handler_yields_500_and_returns_instance_to_pool() {
        let container = container();
        container.register_sync("boom", &["/boom"], || Box::new(PanickingHandler));
        let response = container.dispatch(sample_request("/boom")).wait().unwrap();
        assert_eq!(response.status, http::StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(container.stats().exceptions, 1);

        // A second dispatch must still find a usable instance: the first
        // one panicked mid-service but was released back to its pool.
        let response = container.dispatch(sample_request("/boom")).wait().unwrap();
        assert_eq!(response.status, http::StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(container.stats().exceptions, 2);
    }

    #[test]
    fn dispatches_to_registered_async_handler() {
        let container = container();
        container.register_async("deferred", &["/deferred"], || Box::new(DeferredHandler));
        let response = container
            .dispatch(sample_request("/deferred"))
            .wait()
            .unwrap();
        assert_eq!(response.body, Bytes::from_static(b"async echo"));
        assert_eq!(container.stats().async_dispatches, 1);
    }
}
