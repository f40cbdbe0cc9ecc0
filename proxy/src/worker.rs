//! Worker event loop.
//!
//! A single thread owns every socket: the frontend listener, one listener per
//! backend address and all accepted connections. Readiness events become
//! balancer calls; the writes and closes the balancer asks for are queued in
//! [`Sockets`] and flushed before the next poll.

use crate::balancer::{Balancer, Transport};
use crate::config::Config;
use crate::engine::MatchingEngine;
use crate::error::ProxyError;
use crate::metrics;
use crate::queue::RouteQueueTable;
use crate::types::{ConnId, GroupKey};
use bytes::{Buf, BytesMut};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Token offset for listeners to avoid collision with connections.
const LISTENER_TOKEN_OFFSET: usize = 1 << 30;

const READ_CHUNK: usize = 16 * 1024;

/// Upper bound on a single poll so the shutdown flag is noticed promptly.
const MAX_POLL_WAIT: Duration = Duration::from_millis(100);

const LISTEN_BACKLOG: i32 = 1024;

/// Run the balancer until `shutdown` is set.
pub fn run(config: &Config, shutdown: Arc<AtomicBool>) -> Result<(), ProxyError> {
    Worker::bind(config)?.run(&shutdown)
}

struct Listener {
    listener: TcpListener,
    address: SocketAddr,
    /// `None` for the frontend listener.
    group: Option<GroupKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Peer {
    Client,
    Backend,
}

struct Connection {
    stream: TcpStream,
    peer: Peer,
    /// Generation counter to detect stale ConnIds after slot reuse.
    generation: u32,
    outbound: BytesMut,
    /// Close once `outbound` is empty.
    closing: bool,
    /// The peer went away or the socket failed; tear down right away.
    broken: bool,
}

/// Accepted connections and their pending output.
#[derive(Default)]
struct Sockets {
    connections: Slab<Connection>,
    next_generation: u32,
    /// Connections with output to flush or a close to act on.
    dirty: Vec<ConnId>,
}

impl Sockets {
    fn insert(
        &mut self,
        registry: &Registry,
        mut stream: TcpStream,
        peer: Peer,
    ) -> io::Result<ConnId> {
        let entry = self.connections.vacant_entry();
        let slot = entry.key();
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);

        registry.register(
            &mut stream,
            Token(slot),
            Interest::READABLE | Interest::WRITABLE,
        )?;

        entry.insert(Connection {
            stream,
            peer,
            generation,
            outbound: BytesMut::new(),
            closing: false,
            broken: false,
        });
        Ok(ConnId::with_generation(slot, generation))
    }

    fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.connections
            .get_mut(id.slot())
            .filter(|c| c.generation == id.generation())
    }

    fn conn_id(&self, token: usize) -> Option<ConnId> {
        self.connections
            .get(token)
            .map(|c| ConnId::with_generation(token, c.generation))
    }

    fn fail(&mut self, id: ConnId) {
        if let Some(conn) = self.get_mut(id) {
            conn.broken = true;
            self.dirty.push(id);
        }
    }

    /// Write as much pending output as the socket takes.
    fn flush(&mut self, id: ConnId) {
        let Some(conn) = self.get_mut(id) else {
            return;
        };
        while !conn.outbound.is_empty() && !conn.broken {
            match conn.stream.write(&conn.outbound) {
                Ok(0) => conn.broken = true,
                Ok(n) => conn.outbound.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    trace!(conn = %id, error = %e, "write failed");
                    conn.broken = true;
                }
            }
        }
    }

    fn is_finished(&mut self, id: ConnId) -> bool {
        self.get_mut(id)
            .is_some_and(|c| c.broken || (c.closing && c.outbound.is_empty()))
    }

    fn remove(&mut self, registry: &Registry, id: ConnId) -> Option<Peer> {
        self.get_mut(id)?;
        let mut conn = self.connections.remove(id.slot());
        if let Err(e) = registry.deregister(&mut conn.stream) {
            trace!(conn = %id, error = %e, "deregister failed");
        }
        Some(conn.peer)
    }

    fn has_pending_writes(&self) -> bool {
        self.connections
            .iter()
            .any(|(_, c)| !c.broken && !c.outbound.is_empty())
    }
}

impl Transport for Sockets {
    fn send(&mut self, conn: ConnId, data: &[u8]) {
        let Some(c) = self.get_mut(conn) else {
            return;
        };
        if c.broken {
            return;
        }
        c.outbound.extend_from_slice(data);
        self.dirty.push(conn);
    }

    fn close_after_writing(&mut self, conn: ConnId) {
        let Some(c) = self.get_mut(conn) else {
            return;
        };
        c.closing = true;
        self.dirty.push(conn);
    }
}

/// The balancer's event loop and every socket it owns.
pub struct Worker {
    poll: Poll,
    events: Events,
    listeners: Slab<Listener>,
    balancer: Balancer<Sockets>,
    read_buf: Box<[u8]>,
    clock_tick: Duration,
    sweep_interval: Duration,
    drain_timeout: Duration,
    next_tick: Instant,
    next_sweep: Instant,
}

impl Worker {
    /// Bind the frontend listener and one listener per distinct backend
    /// address.
    pub fn bind(config: &Config) -> Result<Self, ProxyError> {
        let frontend = config.cluster_addr()?;
        let routing = config.routing()?;
        let poll = Poll::new()?;
        let mut listeners = Slab::new();

        listen(&poll, &mut listeners, frontend, None)?;
        for backend in &routing.backends {
            listen(
                &poll,
                &mut listeners,
                backend.address,
                Some(backend.group.clone()),
            )?;
        }

        if routing.backends.is_empty() {
            warn!("no keepalive map entries, requests will wait until evicted");
        }
        if config.key.is_some() {
            info!("access key configured; backend connections are not authenticated");
        }

        let queues = RouteQueueTable::new(routing.routes, routing.default_route);
        let engine = MatchingEngine::new(queues, config.timeout())
            .with_sticky_eviction(config.limits.evict_sticky);
        let now = Instant::now();

        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            listeners,
            balancer: Balancer::new(engine, Sockets::default(), config.limits.max_request_head),
            read_buf: vec![0; READ_CHUNK].into_boxed_slice(),
            clock_tick: config.timers.clock_tick(),
            sweep_interval: config.timers.sweep_interval(),
            drain_timeout: config.shutdown.drain_timeout(),
            next_tick: now + config.timers.clock_tick(),
            next_sweep: now + config.timers.sweep_interval(),
        })
    }

    /// Bound address of the frontend listener.
    pub fn frontend_addr(&self) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|(_, l)| l.group.is_none())
            .map(|(_, l)| l.address)
    }

    /// Bound backend listener addresses and the group each one serves.
    pub fn backend_addrs(&self) -> Vec<(SocketAddr, GroupKey)> {
        self.listeners
            .iter()
            .filter_map(|(_, l)| l.group.clone().map(|g| (l.address, g)))
            .collect()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Serve until `shutdown` is set, then stop accepting and flush what is
    /// already queued.
    pub fn run(mut self, shutdown: &AtomicBool) -> Result<(), ProxyError> {
        info!(
            frontend = ?self.frontend_addr(),
            backend_listeners = self.listener_count() - 1,
            "balancer running"
        );

        while !shutdown.load(Ordering::Relaxed) {
            let timeout = self.poll_timeout();
            self.poll_once(timeout)?;
        }

        info!("shutting down, closing listeners");
        self.close_listeners();
        self.drain()?;
        metrics::log_summary();
        info!("balancer shutdown complete");
        Ok(())
    }

    fn poll_once(&mut self, timeout: Duration) -> Result<(), ProxyError> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        // Collect event info first to avoid borrow issues
        let ready: Vec<_> = self
            .events
            .iter()
            .map(|e| {
                (
                    e.token().0,
                    e.is_readable() || e.is_read_closed() || e.is_error(),
                    e.is_writable(),
                )
            })
            .collect();

        for (token, readable, writable) in ready {
            if token >= LISTENER_TOKEN_OFFSET {
                self.accept_pending(token - LISTENER_TOKEN_OFFSET);
                continue;
            }
            let Some(id) = self.balancer.transport().conn_id(token) else {
                continue;
            };
            if writable {
                self.balancer.transport_mut().dirty.push(id);
            }
            if readable {
                self.read_pending(id);
            }
        }

        self.run_timers();
        self.settle();
        Ok(())
    }

    fn accept_pending(&mut self, listener_id: usize) {
        loop {
            let Some(listener) = self.listeners.get(listener_id) else {
                return;
            };
            let group = listener.group.clone();

            match listener.listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        trace!(error = %e, "failed to set TCP_NODELAY");
                    }
                    let peer = if group.is_some() {
                        Peer::Backend
                    } else {
                        Peer::Client
                    };
                    let id = match self.balancer.transport_mut().insert(
                        self.poll.registry(),
                        stream,
                        peer,
                    ) {
                        Ok(id) => id,
                        Err(e) => {
                            warn!(peer = %addr, error = %e, "failed to register connection");
                            continue;
                        }
                    };
                    match group {
                        None => {
                            trace!(conn = %id, peer = %addr, "accepted client");
                            self.balancer.client_accepted(id);
                        }
                        Some(group) => {
                            info!(conn = %id, peer = %addr, "accepted backend");
                            self.balancer.backend_accepted(id, group);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Read until the socket would block, handing each chunk to the balancer.
    fn read_pending(&mut self, id: ConnId) {
        loop {
            let Some(conn) = self.balancer.transport_mut().get_mut(id) else {
                return;
            };
            let peer = conn.peer;

            match conn.stream.read(&mut self.read_buf) {
                Ok(0) => {
                    trace!(conn = %id, "peer closed");
                    self.balancer.transport_mut().fail(id);
                    return;
                }
                Ok(n) => {
                    let data = &self.read_buf[..n];
                    match peer {
                        Peer::Client => self.balancer.client_data(id, data),
                        Peer::Backend => self.balancer.backend_data(id, data),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(conn = %id, error = %e, "read failed");
                    self.balancer.transport_mut().fail(id);
                    return;
                }
            }
        }
    }

    fn run_timers(&mut self) {
        let now = Instant::now();
        if now >= self.next_tick {
            self.balancer.tick();
            self.next_tick = now + self.clock_tick;
        }
        if now >= self.next_sweep {
            self.balancer.sweep();
            self.next_sweep = now + self.sweep_interval;
        }
    }

    fn poll_timeout(&self) -> Duration {
        self.next_tick
            .min(self.next_sweep)
            .saturating_duration_since(Instant::now())
            .min(MAX_POLL_WAIT)
    }

    /// Flush queued output and tear down finished connections until nothing
    /// changes. Tearing one side down can queue work for the other.
    fn settle(&mut self) {
        loop {
            let dirty = std::mem::take(&mut self.balancer.transport_mut().dirty);
            if dirty.is_empty() {
                return;
            }
            for id in dirty {
                let sockets = self.balancer.transport_mut();
                sockets.flush(id);
                if !sockets.is_finished(id) {
                    continue;
                }
                match sockets.remove(self.poll.registry(), id) {
                    Some(Peer::Client) => self.balancer.client_closed(id),
                    Some(Peer::Backend) => {
                        info!(conn = %id, "backend disconnected");
                        self.balancer.backend_closed(id);
                    }
                    None => {}
                }
            }
        }
    }

    fn close_listeners(&mut self) {
        for mut listener in self.listeners.drain() {
            if let Err(e) = self.poll.registry().deregister(&mut listener.listener) {
                trace!(address = %listener.address, error = %e, "deregister failed");
            }
        }
    }

    /// Keep polling until queued writes are out or the drain timeout passes.
    fn drain(&mut self) -> Result<(), ProxyError> {
        let deadline = Instant::now() + self.drain_timeout;
        while self.balancer.transport().has_pending_writes() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("drain timeout reached with writes pending");
                break;
            }
            self.poll_once(remaining.min(MAX_POLL_WAIT))?;
        }
        Ok(())
    }
}

fn listen(
    poll: &Poll,
    listeners: &mut Slab<Listener>,
    address: SocketAddr,
    group: Option<GroupKey>,
) -> Result<(), ProxyError> {
    let mut listener = bind_listener(address).map_err(|source| ProxyError::Bind { address, source })?;
    let bound = listener.local_addr()?;

    let entry = listeners.vacant_entry();
    poll.registry().register(
        &mut listener,
        Token(entry.key() + LISTENER_TOKEN_OFFSET),
        Interest::READABLE,
    )?;

    match &group {
        None => info!(address = %bound, "frontend listening"),
        Some(group) => info!(address = %bound, group = %group, "backend listener ready"),
    }
    entry.insert(Listener {
        listener,
        address: bound,
        group,
    });
    Ok(())
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener))
}
