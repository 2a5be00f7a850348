//! Every tunable named in §6 "Environment/configuration": all of it is
//! programmatic, none of it is read from the environment or a file.

use std::net::SocketAddr;
use std::time::Duration;

/// Tunables for [`crate::pool::AdaptiveThreadPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// `min` in §4.1 — the pool never shrinks below this.
    pub min_size: usize,
    /// `max` in §4.1 — the pool never grows past this.
    pub max_size: usize,
    /// Bounded queue capacity before the saturation policy kicks in.
    pub queue_capacity: usize,
    /// Target queue length used by the grow/shrink decision function.
    pub target_queue_size: usize,
    /// `adjustment_factor`, clamped to `[0.01, 0.5]` by the constructor.
    pub adjustment_factor: f64,
    /// How often the feedback scheduler snapshots and resizes.
    pub resize_interval: Duration,
    /// Grace period `shutdown()` waits for in-flight work to drain.
    pub shutdown_grace: Duration,
    /// Thread name prefix; workers are named `"{name}-{n}"`.
    pub name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min_size: 2,
            max_size: 64,
            queue_capacity: 256,
            target_queue_size: 10,
            adjustment_factor: 0.1,
            resize_interval: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(30),
            name: "worker".to_string(),
        }
    }
}

impl PoolConfig {
    /// Clamps `adjustment_factor` into `[0.01, 0.5]` and ensures
    /// `min_size <= max_size`, both at least 1.
    pub fn normalized(mut self) -> Self {
        self.adjustment_factor = self.adjustment_factor.clamp(0.01, 0.5);
        self.min_size = self.min_size.max(1);
        self.max_size = self.max_size.max(self.min_size);
        self
    }
}

/// Tunables for [`crate::context::AsyncContextManager`].
#[derive(Debug, Clone)]
pub struct ContextManagerConfig {
    /// Time-to-live assigned to every new `AsyncContext` at creation.
    pub default_timeout: Duration,
    /// How often the reaper sweeps for expired contexts.
    pub reap_interval: Duration,
}

impl Default for ContextManagerConfig {
    fn default() -> Self {
        ContextManagerConfig {
            default_timeout: Duration::from_secs(30),
            reap_interval: Duration::from_secs(10),
        }
    }
}

/// Tunables for [`crate::switching::ContextSwitchingHandler`].
#[derive(Debug, Clone)]
pub struct SwitchConfig {
    /// Cap on outstanding switch-outs (`active_switches`).
    pub max_concurrent_switches: usize,
    /// Default timeout for `switch_and_execute` calls that don't specify
    /// one explicitly.
    pub default_timeout: Duration,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        SwitchConfig {
            max_concurrent_switches: 1000,
            default_timeout: Duration::from_secs(30),
        }
    }
}

/// A matcher entry for the adaptive strategy's static-asset detection
/// (Design Notes, Open Question 4 — configurable rather than hardcoded).
#[derive(Debug, Clone)]
pub enum StaticMatcher {
    /// Path ends with this suffix, e.g. `.css`.
    Suffix(String),
    /// Path starts with this prefix, e.g. `/static/`.
    Prefix(String),
}

impl StaticMatcher {
    fn matches(&self, path: &str) -> bool {
        match self {
            StaticMatcher::Suffix(s) => path.ends_with(s.as_str()),
            StaticMatcher::Prefix(p) => path.starts_with(p.as_str()),
        }
    }
}

/// Tunables for [`crate::processor::HybridProcessor`].
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Static-asset matcher list; default mirrors spec.md's hardcoded
    /// extension list, but is replaceable.
    pub static_matchers: Vec<StaticMatcher>,
    /// Path prefixes/fragments that route to ASYNC regardless of method.
    pub async_path_markers: Vec<String>,
    /// Sync-path wait ceiling before `RequestTimeout`.
    pub sync_timeout: Duration,
    /// Utilization threshold above which ADAPTIVE picks ASYNC due to
    /// concurrency pressure.
    pub high_concurrency_ratio: f64,
    /// Utilization threshold above which ADAPTIVE's pool-pressure check
    /// picks ASYNC.
    pub adaptive_utilization_threshold: f64,
    /// Any request with `priority > this` forced onto SYNC by
    /// `process_with_priority`.
    pub force_sync_priority_above: i32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            static_matchers: vec![
                StaticMatcher::Suffix(".css".into()),
                StaticMatcher::Suffix(".js".into()),
                StaticMatcher::Suffix(".png".into()),
                StaticMatcher::Suffix(".jpg".into()),
                StaticMatcher::Suffix(".gif".into()),
                StaticMatcher::Suffix(".ico".into()),
                StaticMatcher::Prefix("/static/".into()),
                StaticMatcher::Prefix("/assets/".into()),
            ],
            async_path_markers: vec!["/api/".into(), "/rest/".into(), "/data/".into()],
            sync_timeout: Duration::from_secs(30),
            high_concurrency_ratio: 0.8,
            adaptive_utilization_threshold: 0.7,
            force_sync_priority_above: 5,
        }
    }
}

impl ProcessorConfig {
    /// §4.4 "Request looks like a static asset" predicate.
    pub fn looks_like_static_asset(&self, path: &str) -> bool {
        self.static_matchers.iter().any(|m| m.matches(path))
    }

    /// §4.4 "Method is POST/PUT/DELETE or path begins with ... or
    /// contains ..." predicate (the marker list doubles as prefix and
    /// contains check, matching the three literal path forms in spec.md).
    pub fn looks_like_api_path(&self, method: &http::Method, path: &str) -> bool {
        matches!(
            *method,
            http::Method::POST | http::Method::PUT | http::Method::DELETE
        ) || self.async_path_markers.iter().any(|m| path.contains(m.as_str()))
    }
}

/// Everything needed to frame/keep-alive a connection.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Default `keep_alive` when no `Connection:` header and the request
    /// is HTTP/1.1 (HTTP/1.0 always defaults to `false`).
    pub http11_keep_alive_default: bool,
    /// Read buffer chunk size used by the reactor (§4.5: 8 KiB).
    pub read_chunk: usize,
    /// Size guards from §4.6.
    pub max_request_line: usize,
    pub max_header_block: usize,
    pub max_header_name: usize,
    pub max_header_value: usize,
    pub max_body: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            http11_keep_alive_default: true,
            read_chunk: 8 * 1024,
            max_request_line: 4096,
            max_header_block: 8192,
            max_header_name: 256,
            max_header_value: 4096,
            max_body: 50 * 1024 * 1024,
        }
    }
}

/// Top-level configuration handed to [`crate::reactor::Reactor::bind`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub pool: PoolConfig,
    pub context_manager: ContextManagerConfig,
    pub switching: SwitchConfig,
    pub processor: ProcessorConfig,
    pub channel: ChannelConfig,
    /// Bounded instance-pool size per handler (§4.7).
    pub handler_pool_max: usize,
    /// Prewarm count per handler (§4.7).
    pub handler_pool_prewarm: usize,
}

impl ServerConfig {
    /// A server bound to `addr` with every other tunable at its
    /// documented default.
    pub fn new(addr: SocketAddr) -> Self {
        ServerConfig {
            addr,
            pool: PoolConfig::default(),
            context_manager: ContextManagerConfig::default(),
            switching: SwitchConfig::default(),
            processor: ProcessorConfig::default(),
            channel: ChannelConfig::default(),
            handler_pool_max: 10,
            handler_pool_prewarm: 3,
        }
    }
}
