//! Per-route FIFO queues of waiting clients and pooled backends.
//!
//! New entries are pushed at the back and matches pop from the front, so both
//! sides are served in arrival order. Client queues and backend pools share the
//! same [`GroupKey`] index: a route name resolves to the key of the keepalive
//! group configured for it, and unmapped names queue under the name itself.

use crate::route::Route;
use crate::types::{ConnId, GroupKey, SessionId};
use ahash::AHashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A client waiting for a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waiting {
    pub client: ConnId,
    pub arrived: Instant,
}

/// Which queue currently holds a client.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Normal(GroupKey),
    Sticky(SessionId),
}

#[derive(Debug, Default)]
pub struct RouteQueueTable {
    routes: AHashMap<String, GroupKey>,
    default_route: Option<String>,

    clients: AHashMap<GroupKey, VecDeque<Waiting>>,
    sticky: AHashMap<SessionId, VecDeque<Waiting>>,
    backends: AHashMap<GroupKey, VecDeque<ConnId>>,

    client_slots: AHashMap<ConnId, Slot>,
    backend_slots: AHashMap<ConnId, GroupKey>,
}

impl RouteQueueTable {
    /// Create a table from the mapping of route names to group keys.
    pub fn new(
        routes: impl IntoIterator<Item = (String, GroupKey)>,
        default_route: Option<String>,
    ) -> Self {
        Self {
            routes: routes.into_iter().collect(),
            default_route,
            ..Default::default()
        }
    }

    /// Route name used for requests without a Host header.
    pub fn default_route(&self) -> Option<&str> {
        self.default_route.as_deref()
    }

    /// Group key serving `route_name`.
    pub fn resolve_group(&self, route_name: &str) -> GroupKey {
        self.routes
            .get(route_name)
            .cloned()
            .unwrap_or_else(|| GroupKey::from(route_name))
    }

    /// Queue a client behind the others waiting on the same route.
    ///
    /// Sticky clients wait on the session id they asked for, all others on
    /// their route's group. Returns `false` for unroutable requests, which are
    /// never queued.
    pub fn enqueue_client(&mut self, client: ConnId, route: &Route, arrived: Instant) -> bool {
        // a client id is queued at most once
        self.remove_client(client);

        let entry = Waiting { client, arrived };
        let slot = match route {
            Route::Sticky { requested, .. } => {
                self.sticky
                    .entry(requested.clone())
                    .or_default()
                    .push_back(entry);
                Slot::Sticky(requested.clone())
            }
            Route::Standard { name } => {
                let group = self.resolve_group(name);
                self.clients.entry(group.clone()).or_default().push_back(entry);
                Slot::Normal(group)
            }
            Route::Unroutable => return false,
        };

        self.client_slots.insert(client, slot);
        true
    }

    /// Add a backend to its group's pool.
    pub fn enqueue_backend(&mut self, backend: ConnId, group: &GroupKey) {
        if self.backend_slots.contains_key(&backend) {
            return;
        }
        self.backends
            .entry(group.clone())
            .or_default()
            .push_back(backend);
        self.backend_slots.insert(backend, group.clone());
    }

    pub fn pop_oldest_client(&mut self, group: &GroupKey) -> Option<Waiting> {
        let queue = self.clients.get_mut(group)?;
        let waiting = queue.pop_front();
        if queue.is_empty() {
            self.clients.remove(group);
        }
        let waiting = waiting?;
        self.client_slots.remove(&waiting.client);
        Some(waiting)
    }

    pub fn pop_oldest_sticky_client(&mut self, id: &SessionId) -> Option<Waiting> {
        let queue = self.sticky.get_mut(id)?;
        let waiting = queue.pop_front();
        if queue.is_empty() {
            self.sticky.remove(id);
        }
        let waiting = waiting?;
        self.client_slots.remove(&waiting.client);
        Some(waiting)
    }

    pub fn pop_oldest_backend(&mut self, group: &GroupKey) -> Option<ConnId> {
        let backend = self.backends.get_mut(group)?.pop_front()?;
        self.backend_slots.remove(&backend);
        Some(backend)
    }

    /// Take one specific backend out of `group`'s pool, if it is pooled there.
    pub fn take_backend(&mut self, group: &GroupKey, backend: ConnId) -> bool {
        if self.backend_slots.get(&backend) != Some(group) {
            return false;
        }
        self.remove_backend(backend)
    }

    /// Remove a client from whichever queue holds it. Idempotent.
    pub fn remove_client(&mut self, client: ConnId) -> bool {
        match self.client_slots.remove(&client) {
            Some(slot) => {
                self.remove_from_slot(client, &slot);
                true
            }
            None => false,
        }
    }

    /// Remove a backend from its pool. Idempotent.
    pub fn remove_backend(&mut self, backend: ConnId) -> bool {
        let Some(group) = self.backend_slots.remove(&backend) else {
            return false;
        };
        if let Some(pool) = self.backends.get_mut(&group) {
            pool.retain(|b| *b != backend);
        }
        true
    }

    pub fn is_pooled(&self, backend: ConnId) -> bool {
        self.backend_slots.contains_key(&backend)
    }

    pub fn is_queued(&self, client: ConnId) -> bool {
        self.client_slots.contains_key(&client)
    }

    pub fn has_sticky_waiting(&self, id: &SessionId) -> bool {
        self.sticky.get(id).is_some_and(|q| !q.is_empty())
    }

    pub fn pool_len(&self, group: &GroupKey) -> usize {
        self.backends.get(group).map_or(0, VecDeque::len)
    }

    /// Total clients waiting in normal and sticky queues.
    pub fn waiting_clients(&self) -> usize {
        self.client_slots.len()
    }

    /// Total backends idle in pools.
    pub fn pooled_backends(&self) -> usize {
        self.backend_slots.len()
    }

    /// Remove every normal-queue client that has waited at least `timeout` on a
    /// group with no pooled backend.
    ///
    /// Each queue is walked oldest first and the walk stops at the first client
    /// that has not expired; that client and everyone behind it keep their
    /// positions.
    pub fn expire_clients(&mut self, now: Instant, timeout: Duration) -> Vec<ConnId> {
        let mut expired = Vec::new();
        let starved: Vec<GroupKey> = self
            .clients
            .keys()
            .filter(|group| self.pool_len(group) == 0)
            .cloned()
            .collect();

        for group in starved {
            if let Some(queue) = self.clients.get_mut(&group) {
                drain_expired(queue, now, timeout, &mut expired);
                if queue.is_empty() {
                    self.clients.remove(&group);
                }
            }
        }

        for client in &expired {
            self.client_slots.remove(client);
        }
        expired
    }

    /// Remove every sticky client that has waited at least `timeout`.
    ///
    /// A sticky queue only exists while its backend is not pooled, so every
    /// sticky queue is starved by definition.
    pub fn expire_sticky_clients(&mut self, now: Instant, timeout: Duration) -> Vec<ConnId> {
        let mut expired = Vec::new();
        self.sticky.retain(|_, queue| {
            drain_expired(queue, now, timeout, &mut expired);
            !queue.is_empty()
        });
        for client in &expired {
            self.client_slots.remove(client);
        }
        expired
    }

    fn remove_from_slot(&mut self, client: ConnId, slot: &Slot) {
        match slot {
            Slot::Normal(group) => {
                if let Some(queue) = self.clients.get_mut(group) {
                    queue.retain(|w| w.client != client);
                    if queue.is_empty() {
                        self.clients.remove(group);
                    }
                }
            }
            Slot::Sticky(id) => {
                if let Some(queue) = self.sticky.get_mut(id) {
                    queue.retain(|w| w.client != client);
                    if queue.is_empty() {
                        self.sticky.remove(id);
                    }
                }
            }
        }
    }
}

fn drain_expired(
    queue: &mut VecDeque<Waiting>,
    now: Instant,
    timeout: Duration,
    expired: &mut Vec<ConnId>,
) {
    while let Some(oldest) = queue.front() {
        if now.saturating_duration_since(oldest.arrived) < timeout {
            break;
        }
        expired.push(oldest.client);
        queue.pop_front();
    }
}
