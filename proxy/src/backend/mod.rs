//! Backend connection management.

mod connection;
pub mod framing;

pub use connection::{BackendConnection, BackendEvent, BackendState};
pub use framing::FramingError;
