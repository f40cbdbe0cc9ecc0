//! Identifiers shared by the engine, the state machines and the worker.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Identifies one accepted socket, frontend or backend.
///
/// The low 32 bits are the slab slot the worker stores the socket in and the
/// high 32 bits a generation counter, so an id held by a peer after its socket
/// was closed never aliases a newer connection that reused the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    /// Create a connection ID from a raw slot value (generation 0).
    ///
    /// This is primarily useful for testing purposes.
    #[inline]
    pub fn new(slot: usize) -> Self {
        Self(slot as u64)
    }

    /// Create a connection ID with both slot and generation.
    #[inline]
    pub fn with_generation(slot: usize, generation: u32) -> Self {
        Self(((generation as u64) << 32) | (slot as u64 & 0xFFFF_FFFF))
    }

    /// Get the slot index from this connection ID.
    #[inline]
    pub fn slot(&self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    /// Get the generation counter from this connection ID.
    #[inline]
    pub fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.slot(), self.generation())
    }
}

/// Key shared by every backend configured under one keepalive group.
///
/// Client queues and backend pools are both indexed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey(Arc<str>);

impl GroupKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for GroupKey {
    fn from(key: &str) -> Self {
        Self(Arc::from(key))
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // group keys are 128 hex chars, the prefix is enough to tell them apart in logs
        let short = self.0.get(..12).unwrap_or(self.as_str());
        f.write_str(short)
    }
}

/// Token a backend announces once per connection lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(Bytes);

impl SessionId {
    /// Number of bytes a backend sends as its session id.
    pub const LEN: usize = 12;

    pub fn new(id: impl Into<Bytes>) -> Self {
        Self(id.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(Bytes::copy_from_slice(id.as_bytes()))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}
