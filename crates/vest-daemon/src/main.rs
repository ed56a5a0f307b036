//! vest-daemon entry point.
//!
//! Starts the local control daemon: clients connect over TCP, send one JSON
//! object per line, and the daemon drives the attached haptic vests.
//!
//! # Usage
//!
//! ```text
//! vest-daemon [OPTIONS]
//!
//! Options:
//!   --config <PATH>        Config file [default: platform config dir]
//!   --bind <ADDR>          Listen address [default: from config, 127.0.0.1]
//!   --port <PORT>          Listen port [default: from config, 5050]
//!   --log-level <LEVEL>    error|warn|info|debug|trace
//!   --mock-devices <N>     Create N connected mock vests at startup
//!   --no-pid-file          Do not write the PID file
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable             | Description                         |
//! |----------------------|-------------------------------------|
//! | `VEST_CONFIG`        | Config file path                    |
//! | `VEST_BIND`          | Listen address                      |
//! | `VEST_PORT`          | Listen port                         |
//! | `VEST_LOG_LEVEL`     | Log level (`RUST_LOG` wins if set)  |
//! | `VEST_MOCK_DEVICES`  | Mock vests to create at startup     |
//!
//! CLI args take precedence over environment variables, which take
//! precedence over the config file.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vest_daemon::infrastructure::device::usb::UsbBackend;
use vest_daemon::infrastructure::lifecycle::PidFile;
use vest_daemon::infrastructure::runtime::{Daemon, DaemonSettings};
use vest_daemon::infrastructure::storage::config::{load_config, AppConfig};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Local control daemon for haptic vests.
#[derive(Debug, Parser)]
#[command(
    name = "vest-daemon",
    about = "Local control daemon multiplexing haptic vests between TCP clients",
    version
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, env = "VEST_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on.  Keep this on loopback: the protocol has no
    /// authentication.
    #[arg(long, env = "VEST_BIND")]
    bind: Option<String>,

    /// TCP port to listen on.
    #[arg(long, env = "VEST_PORT")]
    port: Option<u16>,

    /// Log level used when `RUST_LOG` is not set.
    #[arg(long, env = "VEST_LOG_LEVEL")]
    log_level: Option<String>,

    /// Number of connected mock vests to create at startup.
    #[arg(long, default_value_t = 0, env = "VEST_MOCK_DEVICES")]
    mock_devices: usize,

    /// Skip writing the PID file.
    #[arg(long)]
    no_pid_file: bool,
}

impl Cli {
    /// Applies command-line overrides on top of the loaded config.
    fn apply(&self, config: &mut AppConfig) {
        if let Some(bind) = &self.bind {
            config.network.bind_address = bind.clone();
        }
        if let Some(port) = self.port {
            config.network.port = port;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref()).context("failed to load configuration")?;
    cli.apply(&mut config);

    // `RUST_LOG` wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("vest-daemon {} starting", env!("CARGO_PKG_VERSION"));

    let backend = Arc::new(UsbBackend::new(config.device.usb_settings()));
    let daemon = Daemon::start(DaemonSettings::from_config(&config), backend).await?;

    // Written only after the bind succeeded, so it always names a live daemon.
    let _pid_file = if cli.no_pid_file {
        None
    } else {
        Some(PidFile::create(PidFile::default_path(daemon.local_addr().port()))?)
    };

    if cli.mock_devices > 0 {
        let ids = daemon.create_mock_devices(cli.mock_devices).await?;
        info!("created {} mock device(s)", ids.len());
    }

    let running = daemon.running();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C; shutting down");
                running.store(false, Ordering::Relaxed);
            }
            Err(e) => error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    daemon.run_until_stopped().await;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
