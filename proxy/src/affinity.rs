//! Registry of which backend announced which session id.

use crate::types::{ConnId, SessionId};
use ahash::AHashMap;

/// Bidirectional map between pooled backends and the session ids they announced.
#[derive(Debug, Default)]
pub struct AffinityRegistry {
    by_backend: AHashMap<ConnId, SessionId>,
    by_id: AHashMap<SessionId, ConnId>,
}

impl AffinityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `backend` as the owner of `id`, replacing any id it announced before.
    pub fn register(&mut self, backend: ConnId, id: SessionId) {
        if let Some(previous) = self.by_backend.insert(backend, id.clone()) {
            self.forget_id(&previous, backend);
        }
        self.by_id.insert(id, backend);
    }

    pub fn lookup_backend(&self, id: &SessionId) -> Option<ConnId> {
        self.by_id.get(id).copied()
    }

    pub fn lookup_id(&self, backend: ConnId) -> Option<&SessionId> {
        self.by_backend.get(&backend)
    }

    /// Drop both directions for `backend`.
    pub fn remove(&mut self, backend: ConnId) -> Option<SessionId> {
        let id = self.by_backend.remove(&backend)?;
        self.forget_id(&id, backend);
        Some(id)
    }

    pub fn len(&self) -> usize {
        self.by_backend.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_backend.is_empty()
    }

    // a newer backend may have announced the same id; only drop the reverse
    // entry if it still points at this backend
    fn forget_id(&mut self, id: &SessionId, backend: ConnId) {
        if self.by_id.get(id) == Some(&backend) {
            self.by_id.remove(id);
        }
    }
}
