//! Balancer metrics.

use metriken::{Counter, Gauge, metric};
use tracing::info;

/// Open frontend client connections.
#[metric(name = "balancer_frontend_connections")]
pub static FRONTEND_CONNECTIONS: Gauge = Gauge::new();

/// Open backend connections.
#[metric(name = "balancer_backend_connections")]
pub static BACKEND_CONNECTIONS: Gauge = Gauge::new();

/// Idle backends sitting in a pool.
#[metric(name = "balancer_pooled_backends")]
pub static POOLED_BACKENDS: Gauge = Gauge::new();

/// Routed clients waiting for a backend.
#[metric(name = "balancer_waiting_clients")]
pub static WAITING_CLIENTS: Gauge = Gauge::new();

/// Client/backend pairings.
#[metric(name = "balancer_matches")]
pub static MATCHES: Counter = Counter::new();

/// Clients answered with 503 after waiting too long.
#[metric(name = "balancer_evictions")]
pub static EVICTIONS: Counter = Counter::new();

/// Responses relayed in full.
#[metric(name = "balancer_responses")]
pub static RESPONSES: Counter = Counter::new();

/// Backend responses that could not be framed.
#[metric(name = "balancer_framing_errors")]
pub static FRAMING_ERRORS: Counter = Counter::new();

/// Log totals, called once on the way out.
pub fn log_summary() {
    info!(
        matches = MATCHES.value(),
        responses = RESPONSES.value(),
        evictions = EVICTIONS.value(),
        framing_errors = FRAMING_ERRORS.value(),
        "balancer totals"
    );
}
