//! Signal handling for graceful shutdown.

use evio::LoopHandle;
use tracing::info;

/// On SIGINT/SIGTERM, ask the base loop to quit so `main` can fall through
/// its run call and tear the server down.
pub fn install(base_loop: LoopHandle) {
    ctrlc::set_handler(move || {
        info!("shutdown signal received");
        base_loop.quit();
    })
    .expect("failed to install signal handler");
}
