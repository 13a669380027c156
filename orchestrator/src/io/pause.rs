//! File-based pause gate.
//!
//! Operators pause a run by creating a sentinel file; the orchestrator checks
//! for it between stories and at the top of each chain group, blocking until
//! the file is removed. Cooperative only: an in-flight session is never
//! preempted.

use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::info;

/// True if the pause sentinel exists.
pub fn is_paused(pause_file: &Path) -> bool {
    pause_file.exists()
}

/// Block until the sentinel is removed, polling at `interval`.
pub fn wait_while_paused(pause_file: &Path, interval: Duration) {
    if !is_paused(pause_file) {
        return;
    }
    info!(path = %pause_file.display(), "paused; waiting for sentinel removal");
    while is_paused(pause_file) {
        thread::sleep(interval);
    }
    info!("pause sentinel removed, continuing");
}
