//! Periodic USB bus scan.
//!
//! Polls the backend every `interval` and hands the result to
//! [`CommandRouter::reconcile_hardware`], which announces attach/detach
//! changes and disconnects vests that vanished from the bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::application::command_router::CommandRouter;
use crate::infrastructure::device::VestBackend;

/// Spawns the scan loop.  It stops once `running` is cleared.
pub fn spawn_hotplug_watcher(
    router: Arc<CommandRouter>,
    backend: Arc<dyn VestBackend>,
    interval: Duration,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("hotplug: scanning every {interval:?}");
        while running.load(Ordering::Relaxed) {
            let scan_backend = Arc::clone(&backend);
            match tokio::task::spawn_blocking(move || scan_backend.enumerate()).await {
                Ok(Ok(devices)) => router.reconcile_hardware(devices).await,
                Ok(Err(e)) => warn!("hotplug: bus scan failed: {e}"),
                Err(e) => warn!("hotplug: scan task panicked: {e}"),
            }
            tokio::time::sleep(interval).await;
        }
        debug!("hotplug: stopped");
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
