//! Daemon assembly: binds the socket and starts every background task.
//!
//! ```text
//!  Daemon::start
//!   ├─ TcpListener::bind(host, port)      fails fast if the port is taken
//!   ├─ SessionManager                     EventSink for the router
//!   ├─ CommandRouter                      owns devices, players, playback
//!   ├─ serve()              (task)        accept loop
//!   ├─ run_loss_monitor()   (task)        writer failures → disconnected
//!   └─ hotplug watcher      (task)        optional bus rescans
//! ```
//!
//! `main.rs` uses this with the USB backend; integration tests use it with
//! [`MockBackend`](crate::infrastructure::device::mock::MockBackend) on an
//! ephemeral port.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::application::command_router::{CommandRouter, RouterSettings};
use crate::application::hotplug::spawn_hotplug_watcher;
use crate::domain::DeviceId;
use crate::infrastructure::device::VestBackend;
use crate::infrastructure::network::{serve, ServerSettings, SessionManager};
use crate::infrastructure::storage::config::AppConfig;

/// Everything needed to start a daemon.
#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub bind_address: String,
    /// `0` picks an ephemeral port.
    pub port: u16,
    pub router: RouterSettings,
    pub server: ServerSettings,
    /// Lines buffered per client before it is dropped as too slow.
    pub outbound_buffer: usize,
    /// `None` disables hot-plug rescans.
    pub rescan_interval: Option<Duration>,
}

impl DaemonSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            bind_address: config.network.bind_address.clone(),
            port: config.network.port,
            router: RouterSettings {
                open_timeout: config.device.open_timeout(),
                writer: config.device.writer_settings(),
                max_mock_devices: config.device.max_mock_devices,
            },
            server: ServerSettings {
                max_line_bytes: config.network.max_line_bytes,
                write_timeout: Duration::from_millis(config.session.write_timeout_ms),
            },
            outbound_buffer: config.session.outbound_buffer,
            rescan_interval: config.device.rescan_interval(),
        }
    }
}

/// A running daemon.
pub struct Daemon {
    local_addr: SocketAddr,
    router: Arc<CommandRouter>,
    running: Arc<AtomicBool>,
    server: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Binds the listening socket and starts serving.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound, e.g. because another
    /// instance already owns the port.
    pub async fn start(settings: DaemonSettings, backend: Arc<dyn VestBackend>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind((settings.bind_address.as_str(), settings.port))
            .await
            .with_context(|| {
                format!(
                    "failed to bind control socket on {}:{}",
                    settings.bind_address, settings.port
                )
            })?;
        let local_addr = listener
            .local_addr()
            .context("failed to read bound socket address")?;
        info!("vest-daemon listening on {local_addr}");

        let running = Arc::new(AtomicBool::new(true));
        let sessions = Arc::new(SessionManager::new(settings.outbound_buffer));
        let (router, lost_rx) =
            CommandRouter::new(Arc::clone(&backend), sessions.clone(), settings.router);

        let mut background = vec![tokio::spawn(Arc::clone(&router).run_loss_monitor(lost_rx))];
        if let Some(interval) = settings.rescan_interval {
            background.push(spawn_hotplug_watcher(
                Arc::clone(&router),
                backend,
                interval,
                Arc::clone(&running),
            ));
        }

        let server = tokio::spawn(serve(
            listener,
            Arc::clone(&router),
            sessions,
            settings.server,
            Arc::clone(&running),
        ));

        Ok(Self {
            local_addr,
            router,
            running,
            server,
            background,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn router(&self) -> &Arc<CommandRouter> {
        &self.router
    }

    /// Shared shutdown flag; clearing it stops the accept loop.
    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Creates `count` connected mock vests.
    ///
    /// # Errors
    ///
    /// Fails once the configured mock limit is reached.
    pub async fn create_mock_devices(&self, count: usize) -> anyhow::Result<Vec<DeviceId>> {
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let summary = self
                .router
                .create_mock_device()
                .await
                .context("failed to create mock device")?;
            ids.push(summary.device_id);
        }
        Ok(ids)
    }

    /// Waits until the shutdown flag is cleared, then tears everything down.
    pub async fn run_until_stopped(mut self) {
        if let Err(e) = (&mut self.server).await {
            warn!("accept loop ended abnormally: {e}");
        }
        self.teardown().await;
    }

    /// Stops accepting clients and closes every device.
    pub async fn shutdown(mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Err(e) = (&mut self.server).await {
            warn!("accept loop ended abnormally: {e}");
        }
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        self.router.shutdown().await;
        for task in self.background.drain(..) {
            task.abort();
        }
        info!("vest-daemon stopped");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::device::mock::MockBackend;

    fn test_settings() -> DaemonSettings {
        DaemonSettings {
            bind_address: "127.0.0.1".into(),
            port: 0,
            rescan_interval: None,
            ..DaemonSettings::from_config(&AppConfig::default())
        }
    }

    #[test]
    fn test_settings_follow_config_defaults() {
        let settings = DaemonSettings::from_config(&AppConfig::default());

        assert_eq!(settings.bind_address, "127.0.0.1");
        assert_eq!(settings.port, 5050);
        assert_eq!(settings.server.max_line_bytes, 65536);
        assert_eq!(settings.router.max_mock_devices, 20);
        assert_eq!(settings.rescan_interval, Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_second_daemon_on_same_port_fails_to_bind() {
        // Arrange
        let first = Daemon::start(test_settings(), Arc::new(MockBackend::new()))
            .await
            .unwrap();
        let taken = DaemonSettings {
            port: first.local_addr().port(),
            ..test_settings()
        };

        // Act
        let second = Daemon::start(taken, Arc::new(MockBackend::new())).await;

        // Assert
        assert!(second.is_err());
        first.shutdown().await;
    }

    #[tokio::test]
    async fn test_startup_mock_devices_are_created() {
        let daemon = Daemon::start(test_settings(), Arc::new(MockBackend::new()))
            .await
            .unwrap();

        let ids = daemon.create_mock_devices(2).await.unwrap();

        assert_eq!(ids.len(), 2);
        assert!(ids.iter().all(|id| id.as_str().starts_with("mock_")));
        daemon.shutdown().await;
    }
}
