//! Client connection handling.

use crate::request;
use crate::route::Route;
use crate::types::ConnId;
use bytes::{Bytes, BytesMut};

/// Fixed response for clients that waited too long for a backend.
pub const SERVER_UNAVAILABLE: &[u8] = b"HTTP/1.0 503 Server Unavailable\r\n\
Content-type: text/plain\r\n\
Connection: close\r\n\
\r\n\
Server Unavailable";

/// State of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Still reading the request head.
    Unrouted,

    /// Headers ended without a Host header and there is no default route.
    /// The request waits here until the client goes away.
    Stalled,

    /// Submitted for matching; queued or associated with a backend.
    Routed,

    /// A close was requested; further input is ignored.
    Closing,
}

/// What a chunk of input meant for the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Nothing new to act on (bytes were buffered).
    Buffered,

    /// The request became routable.
    Routed(Route),

    /// Headers ended but no route could be derived.
    Unroutable,

    /// The unrouted head grew past the configured limit.
    HeadTooLarge,
}

/// A frontend client connection.
#[derive(Debug)]
pub struct ClientConnection {
    pub conn_id: ConnId,

    state: ClientState,

    /// Bytes not yet forwarded, oldest first.
    pending: BytesMut,

    /// Request target, kept for sticky matching.
    uri: Option<String>,

    backend: Option<ConnId>,

    max_head: usize,
}

impl ClientConnection {
    pub fn new(conn_id: ConnId, max_head: usize) -> Self {
        Self {
            conn_id,
            state: ClientState::Unrouted,
            pending: BytesMut::with_capacity(4096),
            uri: None,
            backend: None,
            max_head,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn backend(&self) -> Option<ConnId> {
        self.backend
    }

    pub fn is_closing(&self) -> bool {
        self.state == ClientState::Closing
    }

    /// Append received bytes and work out whether the request is routable yet.
    pub fn receive(&mut self, data: &[u8], default_route: Option<&str>) -> ClientEvent {
        if self.is_closing() {
            return ClientEvent::Buffered;
        }
        self.pending.extend_from_slice(data);

        match self.state {
            ClientState::Unrouted => {}
            ClientState::Stalled if self.pending.len() > self.max_head => {
                return ClientEvent::HeadTooLarge;
            }
            _ => return ClientEvent::Buffered,
        }

        let head = request::scan(&self.pending);
        if self.uri.is_none() {
            self.uri = head.uri.clone();
        }

        if !head.is_routable() {
            if self.pending.len() > self.max_head {
                return ClientEvent::HeadTooLarge;
            }
            return ClientEvent::Buffered;
        }

        let name = head.host.as_deref().or(default_route);
        match Route::classify(name, self.uri.as_deref()) {
            Route::Unroutable => {
                self.state = ClientState::Stalled;
                ClientEvent::Unroutable
            }
            route => {
                self.state = ClientState::Routed;
                ClientEvent::Routed(route)
            }
        }
    }

    /// Record the backend this client was matched with.
    pub fn associate(&mut self, backend: ConnId) {
        self.backend = Some(backend);
    }

    /// Take every buffered byte for forwarding, if a backend is associated.
    pub fn push(&mut self) -> Option<(ConnId, Bytes)> {
        let backend = self.backend?;
        if self.pending.is_empty() {
            return None;
        }
        Some((backend, self.pending.split().freeze()))
    }

    /// Stop accepting input; the connection is about to be closed.
    pub fn mark_closing(&mut self) {
        self.state = ClientState::Closing;
        self.pending.clear();
    }
}
