//! C7 — the single-threaded I/O reactor: a readiness demultiplexer over
//! accepted sockets, feeding complete requests to the worker pool via
//! [`crate::handler::HandlerContainer`] and writing back whatever
//! response eventually lands in each connection's response slot.
//!
//! §4.5's per-tick algorithm, one iteration of [`Reactor::run`]'s loop:
//! block on `mio::Poll` with a 1-second timeout, then for every ready
//! socket: accept, read, write, or close, depending on which interest
//! fired. Dispatch itself — parsing and routing — runs on the worker
//! pool, never on this thread; this thread only ever touches sockets and
//! interest sets.

use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex as PLMutex;
use slab::Slab;

use crate::channel::ChannelContext;
use crate::config::ServerConfig;
use crate::handler::HandlerContainer;
use crate::pool::AdaptiveThreadPool;
use crate::wire::{self, Response};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const TOKEN_OFFSET: usize = 2;
const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const READ_CHUNK_MAX: usize = 64 * 1024;

/// Point-in-time counters (§8 invariant 1: live connections track
/// accepted − closed exactly).
#[derive(Debug, Clone, Default)]
pub struct ReactorStats {
    pub live_connections: i64,
    pub accepted_total: u64,
    pub closed_total: u64,
    pub requests_dispatched: u64,
}

struct Counters {
    live: AtomicI64,
    accepted: AtomicU64,
    closed: AtomicU64,
    dispatched: AtomicU64,
}

/// Shared, reference-counted per-connection state. The framing
/// state machine (`&mut self` methods) is only ever touched from the
/// reactor thread; the response slot (`&self` methods) is also written
/// from whichever worker thread finishes dispatch, so the whole value
/// lives behind a lock even though contention is effectively zero.
type SharedChannel = Arc<PLMutex<ChannelContext>>;

struct Connection {
    stream: TcpStream,
    context: SharedChannel,
    write_buf: Option<Bytes>,
    write_offset: usize,
    dispatch_in_flight: bool,
}

impl Connection {
    fn token(index: usize) -> Token {
        Token(index + TOKEN_OFFSET)
    }

    fn index(token: Token) -> usize {
        token.0 - TOKEN_OFFSET
    }
}

/// A cheap, `Send + Sync` way to ask a running [`Reactor`] to stop. The
/// reactor itself is driven by [`Reactor::run`], which takes `&mut self`
/// and blocks the calling thread — this handle is what a different
/// thread holds to signal it.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }
}

/// Owns the listening socket, the demultiplexer, and the live-connection
/// table. Constructed with [`Reactor::bind`]; driven with [`Reactor::run`].
pub struct Reactor {
    poll: Poll,
    listener: TcpListener,
    waker: Arc<Waker>,
    connections: Slab<Connection>,
    config: ServerConfig,
    container: Arc<HandlerContainer>,
    pool: AdaptiveThreadPool,
    shutdown: Arc<AtomicBool>,
    next_connection_id: u64,
    counters: Arc<Counters>,
}

impl Reactor {
    /// Binds `config.addr` and registers the listener and wake-up token
    /// with a fresh demultiplexer. Does not start serving — call
    /// [`Reactor::run`] for that.
    pub fn bind(
        config: ServerConfig,
        container: Arc<HandlerContainer>,
        pool: AdaptiveThreadPool,
    ) -> io::Result<Self> {
        let addr: SocketAddr = config.addr;
        let mut listener = TcpListener::bind(addr)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        Ok(Reactor {
            poll,
            listener,
            waker,
            connections: Slab::new(),
            config,
            container,
            pool,
            shutdown: Arc::new(AtomicBool::new(false)),
            next_connection_id: 0,
            counters: Arc::new(Counters {
                live: AtomicI64::new(0),
                accepted: AtomicU64::new(0),
                closed: AtomicU64::new(0),
                dispatched: AtomicU64::new(0),
            }),
        })
    }

    /// The address the listening socket is actually bound to — useful
    /// when `config.addr` asked for an ephemeral port.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// A handle another thread can use to ask this reactor to stop. Safe
    /// to call before or during [`Reactor::run`].
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: self.shutdown.clone(),
            waker: self.waker.clone(),
        }
    }

    pub fn stats(&self) -> ReactorStats {
        ReactorStats {
            live_connections: self.counters.live.load(Ordering::Relaxed),
            accepted_total: self.counters.accepted.load(Ordering::Relaxed),
            closed_total: self.counters.closed.load(Ordering::Relaxed),
            requests_dispatched: self.counters.dispatched.load(Ordering::Relaxed),
        }
    }

    /// Runs the per-tick loop until `shutdown_handle().trigger()` is
    /// called. Blocks the calling thread.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);

        while !self.shutdown.load(Ordering::SeqCst) {
            match self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }

            let mut woken = false;
            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_all()?,
                    WAKER => woken = true,
                    token => self.handle_connection_event(token, event),
                }
            }

            if woken {
                self.arm_pending_writes();
            }
        }

        self.shutdown_all();
        Ok(())
    }

    fn accept_all(&mut self) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let index = self.connections.vacant_key();
                    let token = Connection::token(index);
                    if let Err(err) = self
                        .poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)
                    {
                        tracing::warn!(%peer, error = %err, "failed to register accepted socket");
                        continue;
                    }

                    let connection_id = self.next_connection_id;
                    self.next_connection_id += 1;
                    let context = Arc::new(PLMutex::new(ChannelContext::new(
                        connection_id,
                        self.config.channel.clone(),
                    )));
                    self.connections.insert(Connection {
                        stream,
                        context,
                        write_buf: None,
                        write_offset: 0,
                        dispatch_in_flight: false,
                    });

                    self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                    self.counters.live.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(connection_id, %peer, "accepted connection");
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    return Ok(());
                }
            }
        }
    }

    fn handle_connection_event(&mut self, token: Token, event: &mio::event::Event) {
        let index = Connection::index(token);
        if !self.connections.contains(index) {
            return;
        }

        if event.is_error() || (!event.is_readable() && !event.is_writable()) {
            self.close_connection(index);
            return;
        }

        if event.is_readable() {
            if let Err(()) = self.handle_readable(index) {
                return; // connection already closed
            }
        }
        if self.connections.contains(index) && event.is_writable() {
            let _ = self.handle_writable(index);
        }
    }

    /// Reads up to one 8 KiB chunk (§4.5: "read up to a fixed buffer
    /// worth of bytes"), advances the framing state machine, and
    /// dispatches once a request is complete. Returns `Err(())` if the
    /// connection was closed as part of handling this event.
    fn handle_readable(&mut self, index: usize) -> Result<(), ()> {
        let chunk = self.config.channel.read_chunk.min(READ_CHUNK_MAX);
        let mut buf = vec![0u8; chunk];

        let read = {
            let conn = &mut self.connections[index];
            conn.stream.read(&mut buf)
        };

        match read {
            Ok(0) => {
                self.close_connection(index);
                Err(())
            }
            Ok(n) => {
                let complete = {
                    let conn = &self.connections[index];
                    let mut ctx = conn.context.lock();
                    ctx.feed(&buf[..n])
                };
                match complete {
                    Ok(true) => {
                        self.clear_interest_for_dispatch(index);
                        self.dispatch(index);
                        Ok(())
                    }
                    Ok(false) => Ok(()),
                    Err(err) => {
                        tracing::warn!(
                            kind = crate::error::kind_label(&err),
                            error = %err,
                            "framing error, closing connection"
                        );
                        self.fail_connection(index, err);
                        Err(())
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => {
                tracing::debug!(error = %err, "read failed, closing connection");
                self.close_connection(index);
                Err(())
            }
        }
    }

    /// Submits the parse-then-route work to the pool (§4.5 "Dispatch").
    /// The reactor thread never blocks on parsing, routing, or handler
    /// execution.
    fn dispatch(&mut self, index: usize) {
        let conn = &mut self.connections[index];
        conn.dispatch_in_flight = true;
        let context = conn.context.clone();
        let raw = { context.lock().buffer().to_vec() };

        let container = self.container.clone();
        let waker = self.waker.clone();
        let counters = self.counters.clone();

        self.pool.submit(
            move || {
                let response = match wire::parse_request(&raw) {
                    Ok(request) => {
                        let path_for_log = request.path().to_string();
                        let deferred = container.dispatch(request);
                        let context = context.clone();
                        let waker = waker.clone();
                        let counters = counters.clone();
                        deferred.on_complete(move |result| {
                            let response = match result {
                                Ok(response) => response,
                                Err(err) => Response::text(err.status_code(), err.to_string()),
                            };
                            context.lock().publish_response(response);
                            counters.dispatched.fetch_add(1, Ordering::Relaxed);
                            tracing::trace!(path = %path_for_log, "response published");
                            let _ = waker.wake();
                        });
                        return;
                    }
                    Err(err) => Response::text(err.status_code(), err.to_string()),
                };
                context.lock().publish_response(response);
                let _ = waker.wake();
            },
            0,
        );
    }

    /// §4.5: "clear READABLE interest on the socket" once a request is
    /// complete and handed off — the socket sits unregistered until
    /// [`Self::arm_pending_writes`] re-registers it for `WRITABLE`.
    fn clear_interest_for_dispatch(&mut self, index: usize) {
        let conn = &mut self.connections[index];
        let _ = self.poll.registry().deregister(&mut conn.stream);
    }

    /// After a waker event, scan connections whose dispatch completed and
    /// arm `WRITABLE` interest for them (mio registration changes must
    /// happen on this thread, which is why the worker-thread completion
    /// callback only publishes the response and wakes us).
    fn arm_pending_writes(&mut self) {
        let ready: Vec<usize> = self
            .connections
            .iter()
            .filter_map(|(index, conn)| {
                if conn.dispatch_in_flight && conn.context.lock().peek_response().is_some() {
                    Some(index)
                } else {
                    None
                }
            })
            .collect();

        for index in ready {
            let conn = &mut self.connections[index];
            conn.dispatch_in_flight = false;
            if self
                .poll
                .registry()
                .register(&mut conn.stream, Connection::token(index), Interest::WRITABLE)
                .is_err()
            {
                self.close_connection(index);
            }
        }
    }

    /// Writes as much of the staged response as the socket accepts right
    /// now, tracking a byte offset across partial writes. On full
    /// completion: recycle the connection for keep-alive or close it
    /// (Design Notes' Open Question 3 resolution: recycling is
    /// implemented).
    fn handle_writable(&mut self, index: usize) -> Result<(), ()> {
        let conn = &mut self.connections[index];
        if conn.write_buf.is_none() {
            let response = match conn.context.lock().peek_response() {
                Some(response) => response,
                None => return Ok(()),
            };
            conn.write_buf = Some(wire::serialize_response(&response));
            conn.write_offset = 0;
        }

        let bytes = conn.write_buf.clone().expect("just populated above");
        loop {
            let remaining = &bytes[conn.write_offset..];
            if remaining.is_empty() {
                break;
            }
            match conn.stream.write(remaining) {
                Ok(0) => {
                    self.close_connection(index);
                    return Err(());
                }
                Ok(n) => conn.write_offset += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => {
                    tracing::debug!(error = %err, "write failed, closing connection");
                    self.close_connection(index);
                    return Err(());
                }
            }
        }

        self.finish_write(index);
        Ok(())
    }

    fn finish_write(&mut self, index: usize) {
        let keep_alive = {
            let conn = &self.connections[index];
            let mut ctx = conn.context.lock();
            let keep_alive = ctx.keep_alive;
            ctx.take_response();
            keep_alive
        };

        if keep_alive {
            let conn = &mut self.connections[index];
            conn.write_buf = None;
            conn.write_offset = 0;
            conn.context.lock().reset_for_new_request();
            if self
                .poll
                .registry()
                .reregister(&mut conn.stream, Connection::token(index), Interest::READABLE)
                .is_err()
            {
                self.close_connection(index);
            }
        } else {
            self.close_connection(index);
        }
    }

    fn fail_connection(&mut self, index: usize, err: crate::error::Error) {
        let response = Response::text(err.status_code(), err.to_string());
        if !self.connections.contains(index) {
            return;
        }
        {
            let conn = &mut self.connections[index];
            conn.context.lock().publish_response(response);
            conn.context.lock().keep_alive = false;
            if self
                .poll
                .registry()
                .reregister(&mut conn.stream, Connection::token(index), Interest::WRITABLE)
                .is_err()
            {
                self.close_connection(index);
                return;
            }
        }
        let _ = self.handle_writable(index);
    }

    /// Idempotently clears a connection from the live table, decrements
    /// `live_connections`, cancels the registry entry, and closes the
    /// socket (§4.5 "Close discipline").
    fn close_connection(&mut self, index: usize) {
        if !self.connections.contains(index) {
            return;
        }
        let mut conn = self.connections.remove(index);
        let _ = self.poll.registry().deregister(&mut conn.stream);
        self.counters.live.fetch_sub(1, Ordering::Relaxed);
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
        let connection_id = conn.context.lock().connection_id;
        tracing::debug!(connection_id, "closed connection");
    }

    /// Shutdown cleanup (§4.5): close every live socket, stop accepting,
    /// and shut down the worker pool.
    fn shutdown_all(&mut self) {
        let indices: HashSet<usize> = self.connections.iter().map(|(i, _)| i).collect();
        for index in indices {
            self.close_connection(index);
        }
        let _ = self.poll.registry().deregister(&mut self.listener);
        self.pool.shutdown();
        tracing::info!("reactor shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContextManagerConfig, PoolConfig, ProcessorConfig, ServerConfig};
    use crate::context::AsyncContextManager;
    use crate::handler::{GlobalContext, HandlerContainer, ResponseBuilder};
    use crate::processor::HybridProcessor;
    use crate::wire::Request as WireRequest;
    use std::io::{BufRead, BufReader};
    use std::net::TcpStream as StdTcpStream;
    use std::thread;
    use std::time::Duration as StdDuration;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn spawn_reactor() -> (SocketAddr, ShutdownHandle, thread::JoinHandle<()>) {
        init_tracing();
        let pool = AdaptiveThreadPool::new(PoolConfig::default());
        let manager = AsyncContextManager::new(ContextManagerConfig::default());
        let processor = Arc::new(HybridProcessor::new(
            pool.clone(),
            manager,
            ProcessorConfig::default(),
        ));
        let container = Arc::new(HandlerContainer::new(
            GlobalContext::default(),
            processor,
            4,
            1,
        ));
        container.register_sync("echo", &["/echo"], || {
            struct Echo;
            impl crate::handler::SyncHandler for Echo {
                fn service(
                    &mut self,
                    request: &WireRequest,
                    response: &mut ResponseBuilder,
                ) -> Response {
                    response.write_string(&format!("hello {}", request.path()));
                    response.build()
                }
            }
            Box::new(Echo)
        });

        let mut config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        config.pool = PoolConfig::default();
        let mut reactor = Reactor::bind(config, container, pool).expect("bind");
        let addr = reactor.listener.local_addr().expect("local_addr");
        let handle = reactor.shutdown_handle();

        let join = thread::spawn(move || {
            reactor.run().expect("reactor run");
        });

        (addr, handle, join)
    }

    fn read_response(stream: &mut StdTcpStream) -> (String, String) {
        stream
            .set_read_timeout(Some(StdDuration::from_secs(5)))
            .unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut status_line = String::new();
        reader.read_line(&mut status_line).unwrap();

        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            if line == "\r\n" || line.is_empty() {
                break;
            }
            if let Some(value) = line
                .to_ascii_lowercase()
                .strip_prefix("content-length:")
            {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }

        let mut body = vec![0u8; content_length];
        std::io::Read::read_exact(&mut reader, &mut body).unwrap();
        (status_line, String::from_utf8(body).unwrap())
    }

    #[test]
    fn s1_accept_dispatch_and_write_a_full_response() {
        let (addr, shutdown, join) = spawn_reactor();

        let mut stream = StdTcpStream::connect(addr).expect("connect");
        stream
            .write_all(b"GET /echo HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .unwrap();

        let (status, body) = read_response(&mut stream);
        assert!(status.starts_with("HTTP/1.1 200"), "status: {status}");
        assert_eq!(body, "hello /echo");

        shutdown.trigger();
        join.join().unwrap();
    }

    #[test]
    fn s2_unmatched_route_is_404() {
        let (addr, shutdown, join) = spawn_reactor();

        let mut stream = StdTcpStream::connect(addr).expect("connect");
        stream
            .write_all(b"GET /nope HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .unwrap();

        let (status, _) = read_response(&mut stream);
        assert!(status.starts_with("HTTP/1.1 404"), "status: {status}");

        shutdown.trigger();
        join.join().unwrap();
    }

    #[test]
    fn s3_keep_alive_serves_a_second_request_on_the_same_connection() {
        let (addr, shutdown, join) = spawn_reactor();

        let mut stream = StdTcpStream::connect(addr).expect("connect");
        stream
            .write_all(b"GET /echo HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let (status, body) = read_response(&mut stream);
        assert!(status.starts_with("HTTP/1.1 200"));
        assert_eq!(body, "hello /echo");

        stream
            .write_all(b"GET /echo HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .unwrap();
        let (status, body) = read_response(&mut stream);
        assert!(status.starts_with("HTTP/1.1 200"));
        assert_eq!(body, "hello /echo");

        shutdown.trigger();
        join.join().unwrap();
    }

    #[test]
    fn s4_malformed_request_line_gets_a_400_and_the_connection_closes() {
        let (addr, shutdown, join) = spawn_reactor();

        let mut stream = StdTcpStream::connect(addr).expect("connect");
        stream.write_all(b"NOT-A-REQUEST\r\n\r\n").unwrap();
        let (status, _) = read_response(&mut stream);
        assert!(status.starts_with("HTTP/1.1 400"), "status: {status}");

        shutdown.trigger();
        join.join().unwrap();
    }
}
