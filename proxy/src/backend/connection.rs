//! Single backend connection.

use super::framing::{self, FramingError, MAX_HEADER_BLOCK};
use crate::types::{ConnId, GroupKey, SessionId};
use bytes::{Bytes, BytesMut};

/// Response-parse state of a backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    /// Waiting for the session id the backend sends once per connection.
    AwaitingSessionId,

    /// Accumulating a response header block.
    AwaitingHeaders,

    /// Forwarding body bytes.
    StreamingBody {
        /// Value of the response's Content-Length.
        content_length: u64,
        /// Body bytes forwarded so far.
        forwarded: u64,
    },
}

/// Something the balancer has to act on after feeding bytes in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// The backend announced its session id.
    Session(SessionId),

    /// Bytes to write to the associated client.
    Forward(Bytes),

    /// The response was fully forwarded. `discarded` bytes received after the
    /// end of the body were dropped.
    Complete { discarded: usize },

    /// The response could not be framed. `flushed` holds everything received
    /// for it so far and goes to the client before it is closed.
    Failed { error: FramingError, flushed: Bytes },
}

/// A pooled backend worker connection.
///
/// Bytes are fed in with [`receive`](Self::receive) and interpreted lazily by
/// [`poll_event`](Self::poll_event), so an association made in response to one
/// event (the session id) is already in place when the next bytes are framed.
#[derive(Debug)]
pub struct BackendConnection {
    pub conn_id: ConnId,

    /// Group whose pool this backend serves.
    pub group: GroupKey,

    state: BackendState,
    session: Option<SessionId>,
    client: Option<ConnId>,

    /// Received but not yet interpreted.
    inbound: BytesMut,
    session_buf: BytesMut,
    header_buf: BytesMut,
}

impl BackendConnection {
    pub fn new(conn_id: ConnId, group: GroupKey) -> Self {
        Self {
            conn_id,
            group,
            state: BackendState::AwaitingSessionId,
            session: None,
            client: None,
            inbound: BytesMut::with_capacity(4096),
            session_buf: BytesMut::with_capacity(SessionId::LEN),
            header_buf: BytesMut::new(),
        }
    }

    pub fn state(&self) -> BackendState {
        self.state
    }

    pub fn session(&self) -> Option<&SessionId> {
        self.session.as_ref()
    }

    pub fn client(&self) -> Option<ConnId> {
        self.client
    }

    /// A backend is serving while it has an associated client.
    pub fn is_serving(&self) -> bool {
        self.client.is_some()
    }

    pub fn associate(&mut self, client: ConnId) {
        self.client = Some(client);
    }

    /// Clear the association and reset parse state for the next response.
    ///
    /// The session id survives; it is fixed for the life of the socket.
    pub fn disassociate(&mut self) -> Option<ConnId> {
        self.reset();
        self.client.take()
    }

    /// Append received bytes.
    pub fn receive(&mut self, data: &[u8]) {
        self.inbound.extend_from_slice(data);
    }

    /// Interpret buffered bytes up to the next event.
    pub fn poll_event(&mut self) -> Option<BackendEvent> {
        match self.state {
            BackendState::AwaitingSessionId => self.read_session(),
            BackendState::AwaitingHeaders => self.read_headers(),
            BackendState::StreamingBody {
                content_length,
                forwarded,
            } => self.read_body(content_length, forwarded),
        }
    }

    fn read_session(&mut self) -> Option<BackendEvent> {
        if self.inbound.is_empty() {
            return None;
        }
        let need = SessionId::LEN - self.session_buf.len();
        let take = need.min(self.inbound.len());
        self.session_buf
            .extend_from_slice(&self.inbound.split_to(take));

        if self.session_buf.len() < SessionId::LEN {
            return None;
        }
        let id = SessionId::new(self.session_buf.split().freeze());
        self.session = Some(id.clone());
        self.state = BackendState::AwaitingHeaders;
        Some(BackendEvent::Session(id))
    }

    fn read_headers(&mut self) -> Option<BackendEvent> {
        if self.inbound.is_empty() {
            return None;
        }
        if self.client.is_none() {
            let mut flushed = std::mem::take(&mut self.header_buf);
            flushed.unsplit(self.inbound.split());
            return Some(self.fail(FramingError::IoFailure, flushed.freeze()));
        }

        // resume the delimiter search a few bytes back in case it straddles reads
        let resume = self.header_buf.len().saturating_sub(framing::HEADER_END.len() - 1);
        self.header_buf.unsplit(self.inbound.split());

        let Some(end) = framing::header_end(&self.header_buf[resume..]).map(|n| n + resume) else {
            if self.header_buf.len() > MAX_HEADER_BLOCK {
                let flushed = std::mem::take(&mut self.header_buf).freeze();
                return Some(self.fail(
                    FramingError::MalformedHeaderBlock("header block too large"),
                    flushed,
                ));
            }
            return None;
        };

        let block = self.header_buf.split_to(end).freeze();
        let trailing = self.header_buf.split();

        match framing::content_length(&block) {
            Ok(content_length) => {
                self.inbound = trailing;
                self.state = BackendState::StreamingBody {
                    content_length,
                    forwarded: 0,
                };
                Some(BackendEvent::Forward(block))
            }
            Err(error) => {
                let mut flushed = BytesMut::from(&block[..]);
                flushed.unsplit(trailing);
                Some(self.fail(error, flushed.freeze()))
            }
        }
    }

    fn read_body(&mut self, content_length: u64, forwarded: u64) -> Option<BackendEvent> {
        if forwarded >= content_length {
            let discarded = self.inbound.len();
            self.reset();
            return Some(BackendEvent::Complete { discarded });
        }
        if self.inbound.is_empty() {
            return None;
        }

        let remaining = content_length - forwarded;
        let take = usize::try_from(remaining).map_or(self.inbound.len(), |r| r.min(self.inbound.len()));
        let chunk = self.inbound.split_to(take).freeze();
        self.state = BackendState::StreamingBody {
            content_length,
            forwarded: forwarded + take as u64,
        };
        Some(BackendEvent::Forward(chunk))
    }

    fn fail(&mut self, error: FramingError, flushed: Bytes) -> BackendEvent {
        self.reset();
        BackendEvent::Failed { error, flushed }
    }

    fn reset(&mut self) {
        self.inbound.clear();
        self.header_buf.clear();
        if self.session.is_some() {
            self.state = BackendState::AwaitingHeaders;
        }
    }
}
