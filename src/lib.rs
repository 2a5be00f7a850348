#![cfg_attr(test, deny(rust_2018_idioms))]

//! # hybridsrv
//!
//! hybridsrv is a hybrid HTTP/1.x application server built around three
//! cooperating pieces: a single-threaded, event-driven I/O reactor, an
//! adaptively sized worker pool, and an explicit context-switching layer
//! for request handlers that need to fall back to blocking I/O without
//! tying up a reactor tick.
//!
//! ## Shape
//!
//! - [`reactor::Reactor`] owns the listening socket and the demultiplexer
//!   (`mio::Poll`). It never runs handler code itself; once a request is
//!   fully framed it hands the bytes to the worker pool and goes back to
//!   polling.
//! - [`pool::AdaptiveThreadPool`] is the bounded, priority-ordered queue
//!   of OS threads that dispatch actually runs on. It grows and shrinks
//!   itself on a feedback loop rather than taking a fixed size.
//! - [`context::AsyncContextManager`] and [`switching::ContextSwitchingHandler`]
//!   give a handler a way to suspend mid-request — parking its
//!   continuation in a process-wide table with a TTL — and resume later
//!   without blocking the worker thread that started it.
//! - [`processor::HybridProcessor`] decides, per request, whether to run
//!   a handler inline on the worker thread or hand it through the
//!   context-switching path, and [`handler::HandlerContainer`] is what a
//!   caller registers handlers with.
//!
//! The HTTP value objects (`Request`/`Response`) are plain structs over
//! `http::{Method, Uri, Version, HeaderMap, StatusCode}`; the wire codec
//! ([`wire`]) and per-connection framing state machine ([`channel`]) are
//! the narrowest possible implementation needed to exercise the above
//! end to end — they don't chunk-encode, don't speak HTTP/2, and don't
//! multiplex a connection past simple keep-alive.
//!
//! ## Non-goals
//!
//! No TLS, no HTTP/2 or later, no chunked transfer-encoding, no
//! streaming request/response bodies, no multipart parsing, no
//! pipelined reuse beyond one in-flight request per connection at a
//! time.

pub use crate::error::{Error, Result};

mod config;
mod error;
mod future;
mod task;
mod timer;

pub mod channel;
pub mod context;
pub mod handler;
pub mod pool;
pub mod processor;
pub mod reactor;
pub mod switching;
pub mod wire;

pub use config::{
    ChannelConfig, ContextManagerConfig, PoolConfig, ProcessorConfig, ServerConfig, StaticMatcher,
    SwitchConfig,
};
pub use context::{AsyncContext, AsyncContextManager, ContextId, ContextManagerStats};
pub use future::{Completer, Deferred};
pub use timer::{TimerHandle, TimerWheel};
pub use handler::{
    AsyncHandler, ContainerStats, GlobalContext, HandlerContainer, PatternRouter, ResponseBuilder,
    Router, SyncHandler,
};
pub use pool::{AdaptiveThreadPool, PoolStats};
pub use processor::{HybridProcessor, ProcessorStats};
pub use reactor::{Reactor, ReactorStats, ShutdownHandle};
pub use switching::{ContextSwitchingHandler, SwitchContext, SwitchStats};
pub use wire::{Request, Response};
