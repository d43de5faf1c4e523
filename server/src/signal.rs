//! Signal handling for graceful shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Install a SIGINT/SIGTERM handler that runs `on_stop` (flushing and
/// closing the append log) and exits 0.
///
/// Only installed when persistence is enabled; without it the default
/// signal disposition terminates the process, which loses nothing.
pub fn install<F>(on_stop: F) -> Arc<AtomicBool>
where
    F: Fn() + Send + 'static,
{
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    ctrlc::set_handler(move || {
        if shutdown_flag.swap(true, Ordering::SeqCst) {
            // Second signal: stop waiting for the clean path.
            tracing::warn!("second shutdown signal, exiting immediately");
            std::process::exit(1);
        }
        tracing::info!("shutdown signal received");
        on_stop();
        std::process::exit(0);
    })
    .expect("failed to install signal handler");

    shutdown
}
