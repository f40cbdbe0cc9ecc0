//! Keepalive balancer: a reverse proxy where backends dial in.
//!
//! Clients connect to the frontend listener and send HTTP requests. Backend
//! processes connect to per-group listeners, announce a 12-byte session id and
//! then serve one request at a time over the same connection. The balancer
//! pairs each routed request with an idle backend of the right group, relays
//! the response framed by its `Content-Length`, and puts the backend back in
//! its pool.

pub mod affinity;
pub mod backend;
pub mod balancer;
pub mod client;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod request;
pub mod route;
pub mod types;
pub mod worker;

pub mod logging;
pub mod signal;

pub use config::Config;
pub use error::ProxyError;
pub use worker::{Worker, run};
