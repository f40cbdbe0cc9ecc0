//! Matching engine.
//!
//! Pairs waiting clients with pooled backends. Every operation runs to
//! completion on the worker thread, so no intermediate state is ever visible
//! to another event.

use crate::affinity::AffinityRegistry;
use crate::clock::ClockCache;
use crate::queue::RouteQueueTable;
use crate::route::Route;
use crate::types::{ConnId, GroupKey, SessionId};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Outcome of submitting a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMatch {
    /// Paired with this backend, which has left its pool.
    Matched(ConnId),
    /// No suitable backend is pooled; the client waits in a queue.
    Queued,
    /// No route could be determined; the client is not queued anywhere.
    Unroutable,
}

pub struct MatchingEngine {
    clock: ClockCache,
    affinity: AffinityRegistry,
    queues: RouteQueueTable,
    timeout: Duration,
    evict_sticky: bool,
}

impl MatchingEngine {
    pub fn new(queues: RouteQueueTable, timeout: Duration) -> Self {
        Self {
            clock: ClockCache::new(),
            affinity: AffinityRegistry::new(),
            queues,
            timeout,
            evict_sticky: true,
        }
    }

    /// Whether sticky clients are subject to the eviction sweep.
    pub fn with_sticky_eviction(mut self, enabled: bool) -> Self {
        self.evict_sticky = enabled;
        self
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn tick(&mut self) {
        self.clock.tick();
    }

    pub fn tick_at(&mut self, now: Instant) {
        self.clock.tick_at(now);
    }

    pub fn default_route(&self) -> Option<&str> {
        self.queues.default_route()
    }

    pub fn queues(&self) -> &RouteQueueTable {
        &self.queues
    }

    pub fn affinity(&self) -> &AffinityRegistry {
        &self.affinity
    }

    /// Match a newly routed client to a pooled backend, or queue it.
    ///
    /// A sticky client is only ever matched to the backend that announced the
    /// session id it asked for; if that backend is not pooled right now the
    /// client waits for it even when other backends are idle.
    pub fn submit_client(&mut self, client: ConnId, route: &Route) -> ClientMatch {
        let arrived = self.clock.now();

        let backend = match route {
            Route::Sticky { name, requested } => {
                let group = self.queues.resolve_group(name);
                self.affinity
                    .lookup_backend(requested)
                    .filter(|backend| self.queues.take_backend(&group, *backend))
            }
            Route::Standard { name } => {
                let group = self.queues.resolve_group(name);
                self.queues.pop_oldest_backend(&group)
            }
            Route::Unroutable => return ClientMatch::Unroutable,
        };

        if let Some(backend) = backend {
            debug!(client = %client, backend = %backend, sticky = route.is_sticky(), "matched client");
            return ClientMatch::Matched(backend);
        }

        self.queues.enqueue_client(client, route, arrived);
        trace!(client = %client, sticky = route.is_sticky(), waiting = self.queues.waiting_clients(), "queued client");
        ClientMatch::Queued
    }

    /// Match a backend that just became idle to a waiting client, or pool it.
    ///
    /// Clients that asked for this backend's session id go first, then the
    /// oldest client waiting on its group.
    pub fn submit_backend(&mut self, backend: ConnId, group: &GroupKey) -> Option<ConnId> {
        let sticky = self
            .affinity
            .lookup_id(backend)
            .and_then(|id| self.queues.pop_oldest_sticky_client(id));

        let waiting = sticky.or_else(|| self.queues.pop_oldest_client(group));
        match waiting {
            Some(waiting) => {
                debug!(client = %waiting.client, backend = %backend, "matched backend");
                Some(waiting.client)
            }
            None => {
                self.queues.enqueue_backend(backend, group);
                trace!(backend = %backend, group = %group, pooled = self.queues.pool_len(group), "pooled backend");
                None
            }
        }
    }

    /// Record the session id a backend announced.
    ///
    /// If the backend is idle and sticky clients are already waiting for that
    /// id, it leaves the pool and the oldest of them is returned.
    pub fn register_session(&mut self, backend: ConnId, id: SessionId) -> Option<ConnId> {
        self.affinity.register(backend, id.clone());

        if !self.queues.is_pooled(backend) || !self.queues.has_sticky_waiting(&id) {
            return None;
        }
        let waiting = self.queues.pop_oldest_sticky_client(&id)?;
        self.queues.remove_backend(backend);
        debug!(client = %waiting.client, backend = %backend, "matched waiting sticky client");
        Some(waiting.client)
    }

    /// Remove a client that disconnected before being matched. Idempotent.
    pub fn remove_client(&mut self, client: ConnId) -> bool {
        self.queues.remove_client(client)
    }

    /// Forget a backend that disconnected: leave its pool and drop its session id.
    pub fn remove_backend(&mut self, backend: ConnId) -> bool {
        self.affinity.remove(backend);
        self.queues.remove_backend(backend)
    }

    /// Evict clients that have waited at least the unavailable timeout on a
    /// route with no pooled backend. Returns them oldest first per queue.
    pub fn evict_expired(&mut self) -> Vec<ConnId> {
        let now = self.clock.now();
        let mut evicted = self.queues.expire_clients(now, self.timeout);
        if self.evict_sticky {
            evicted.extend(self.queues.expire_sticky_clients(now, self.timeout));
        }
        evicted
    }
}
