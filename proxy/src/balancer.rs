//! Connection lifecycle and the matching engine.
//!
//! The balancer owns the matching engine and the state machine of every open
//! frontend and backend connection. The worker reports socket events to it;
//! it decides what to write and what to close, and hands that to a
//! [`Transport`].

use crate::backend::{BackendConnection, BackendEvent};
use crate::client::{ClientConnection, ClientEvent, SERVER_UNAVAILABLE};
use crate::engine::{ClientMatch, MatchingEngine};
use crate::metrics::{
    BACKEND_CONNECTIONS, EVICTIONS, FRAMING_ERRORS, FRONTEND_CONNECTIONS, MATCHES,
    POOLED_BACKENDS, RESPONSES, WAITING_CLIENTS,
};
use crate::types::{ConnId, GroupKey};
use ahash::AHashMap;
use tracing::{debug, trace, warn};

/// Where the balancer's writes and closes go.
///
/// Writes to a connection that no longer exists are dropped. Closing happens
/// after everything queued for the connection has been written, and the
/// worker reports it back through the matching `*_closed` call.
pub trait Transport {
    fn send(&mut self, conn: ConnId, data: &[u8]);

    fn close_after_writing(&mut self, conn: ConnId);
}

pub struct Balancer<T> {
    engine: MatchingEngine,
    clients: AHashMap<ConnId, ClientConnection>,
    backends: AHashMap<ConnId, BackendConnection>,
    transport: T,
    max_head: usize,
}

impl<T: Transport> Balancer<T> {
    pub fn new(engine: MatchingEngine, transport: T, max_head: usize) -> Self {
        Self {
            engine,
            clients: AHashMap::new(),
            backends: AHashMap::new(),
            transport,
            max_head,
        }
    }

    pub fn engine(&self) -> &MatchingEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut MatchingEngine {
        &mut self.engine
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn client(&self, id: ConnId) -> Option<&ClientConnection> {
        self.clients.get(&id)
    }

    pub fn backend(&self, id: ConnId) -> Option<&BackendConnection> {
        self.backends.get(&id)
    }

    // === frontend events ===

    pub fn client_accepted(&mut self, id: ConnId) {
        self.clients
            .insert(id, ClientConnection::new(id, self.max_head));
        FRONTEND_CONNECTIONS.increment();
        trace!(client = %id, "client accepted");
    }

    pub fn client_data(&mut self, id: ConnId, data: &[u8]) {
        let default_route = self.engine.default_route();
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };

        match client.receive(data, default_route) {
            ClientEvent::Buffered => self.push(id),
            ClientEvent::Routed(route) => {
                debug!(client = %id, route = route.name(), sticky = route.is_sticky(), "client routed");
                match self.engine.submit_client(id, &route) {
                    ClientMatch::Matched(backend) => self.pair(id, backend),
                    ClientMatch::Queued => {}
                    // classify only yields Unroutable without a name
                    ClientMatch::Unroutable => {}
                }
            }
            ClientEvent::Unroutable => {
                debug!(client = %id, "no Host header and no default route");
            }
            ClientEvent::HeadTooLarge => {
                warn!(client = %id, limit = self.max_head, "request head too large, closing");
                self.close_client(id);
            }
        }
        self.update_gauges();
    }

    /// The client socket is gone. Safe to call more than once.
    pub fn client_closed(&mut self, id: ConnId) {
        let Some(client) = self.clients.remove(&id) else {
            return;
        };
        FRONTEND_CONNECTIONS.decrement();
        if client.backend().is_none() && self.engine.remove_client(id) {
            debug!(client = %id, "waiting client disconnected");
            self.update_gauges();
        }
        trace!(client = %id, "client closed");
    }

    // === backend events ===

    pub fn backend_accepted(&mut self, id: ConnId, group: GroupKey) {
        self.backends
            .insert(id, BackendConnection::new(id, group.clone()));
        BACKEND_CONNECTIONS.increment();
        debug!(backend = %id, group = %group, "backend connected");
        self.recycle(id, &group);
        self.update_gauges();
    }

    pub fn backend_data(&mut self, id: ConnId, data: &[u8]) {
        let Some(backend) = self.backends.get_mut(&id) else {
            return;
        };
        backend.receive(data);

        while let Some(event) = self.backends.get_mut(&id).and_then(|b| b.poll_event()) {
            match event {
                BackendEvent::Session(session) => {
                    debug!(backend = %id, session = %session, "backend announced session");
                    if let Some(client) = self.engine.register_session(id, session) {
                        self.pair(client, id);
                    }
                }
                BackendEvent::Forward(bytes) => {
                    if let Some(client) = self.backends.get(&id).and_then(|b| b.client()) {
                        self.transport.send(client, &bytes);
                    }
                }
                BackendEvent::Complete { discarded } => {
                    if discarded > 0 {
                        warn!(backend = %id, discarded, "dropped bytes past end of response");
                    }
                    RESPONSES.increment();
                    self.finish(id);
                }
                BackendEvent::Failed { error, flushed } => {
                    FRAMING_ERRORS.increment();
                    warn!(backend = %id, error = %error, "response framing failed, recycling backend");
                    if let Some(client) = self.backends.get(&id).and_then(|b| b.client()) {
                        self.transport.send(client, &flushed);
                    }
                    self.finish(id);
                }
            }
        }
        self.update_gauges();
    }

    /// The backend socket is gone.
    pub fn backend_closed(&mut self, id: ConnId) {
        let Some(mut backend) = self.backends.remove(&id) else {
            return;
        };
        BACKEND_CONNECTIONS.decrement();

        if let Some(client) = backend.disassociate() {
            debug!(backend = %id, client = %client, "backend closed while serving");
            self.close_client(client);
        }
        self.engine.remove_backend(id);
        self.update_gauges();
        debug!(backend = %id, session = ?backend.session().map(ToString::to_string), "backend closed");
    }

    // === timers ===

    /// Refresh the cached clock.
    pub fn tick(&mut self) {
        self.engine.tick();
    }

    /// Answer every client that waited too long with a 503.
    pub fn sweep(&mut self) {
        let evicted = self.engine.evict_expired();
        if evicted.is_empty() {
            return;
        }
        debug!(count = evicted.len(), "evicting clients");
        for id in evicted {
            EVICTIONS.increment();
            self.transport.send(id, SERVER_UNAVAILABLE);
            self.close_client(id);
        }
        self.update_gauges();
    }

    // === internals ===

    /// Associate both sides and flush what the client sent so far.
    fn pair(&mut self, client: ConnId, backend: ConnId) {
        MATCHES.increment();
        match (self.clients.get_mut(&client), self.backends.get_mut(&backend)) {
            (Some(c), Some(b)) => {
                c.associate(backend);
                b.associate(client);
            }
            _ => {
                // the engine only hands out live connections
                warn!(client = %client, backend = %backend, "pairing with a closed connection");
                return;
            }
        }
        self.push(client);
    }

    fn push(&mut self, client: ConnId) {
        if let Some((backend, bytes)) = self.clients.get_mut(&client).and_then(|c| c.push()) {
            self.transport.send(backend, &bytes);
        }
    }

    /// End the current response: close its client and put the backend back.
    fn finish(&mut self, id: ConnId) {
        let Some(backend) = self.backends.get_mut(&id) else {
            return;
        };
        let group = backend.group.clone();
        // an idle backend that sent unsolicited bytes never left its pool
        if let Some(client) = backend.disassociate() {
            self.close_client(client);
            self.recycle(id, &group);
        }
    }

    fn recycle(&mut self, id: ConnId, group: &GroupKey) {
        if let Some(client) = self.engine.submit_backend(id, group) {
            self.pair(client, id);
        }
    }

    fn update_gauges(&self) {
        let queues = self.engine.queues();
        POOLED_BACKENDS.set(queues.pooled_backends() as i64);
        WAITING_CLIENTS.set(queues.waiting_clients() as i64);
    }

    fn close_client(&mut self, id: ConnId) {
        if let Some(client) = self.clients.get_mut(&id) {
            client.mark_closing();
        }
        self.transport.close_after_writing(id);
    }
}
