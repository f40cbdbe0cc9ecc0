//! Signal handling for graceful shutdown.
//!
//! SIGINT and SIGTERM set a shared flag the worker polls between events. A
//! second signal exits immediately without draining.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Install the handler and return the shutdown flag it sets.
pub fn install_signal_handler() -> Result<Arc<AtomicBool>, ctrlc::Error> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown.clone();

    ctrlc::set_handler(move || {
        if shutdown_flag.swap(true, Ordering::SeqCst) {
            tracing::warn!("received second signal, exiting without draining");
            std::process::exit(1);
        }
        tracing::info!("received shutdown signal, draining in-flight responses");
    })?;

    Ok(shutdown)
}
