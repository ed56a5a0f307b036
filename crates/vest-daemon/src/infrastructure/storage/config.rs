//! TOML-based configuration for the daemon.
//!
//! Reads `AppConfig` from an explicit path (`--config`) or from the
//! platform-appropriate config file:
//! - Windows:  `%APPDATA%\vest-daemon\config.toml`
//! - Linux:    `~/.config/vest-daemon/config.toml`
//! - macOS:    `~/Library/Application Support/vest-daemon/config.toml`
//!
//! A missing file is not an error: the daemon runs with defaults.  Every
//! field is optional, so a file only needs the values it changes:
//!
//! ```toml
//! [network]
//! port = 5051
//!
//! [device]
//! rescan_interval_ms = 0   # disable hot-plug polling
//! ```
//!
//! Command-line flags override whatever the file says (see `main.rs`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::infrastructure::device::usb::UsbSettings;
use crate::infrastructure::device::WriterSettings;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listening socket settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// Loopback by default; the protocol has no authentication.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Longest accepted request line, excluding the newline.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

/// Vest hardware and writer settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    #[serde(default = "default_vendor_id")]
    pub vendor_id: u16,
    #[serde(default = "default_product_id")]
    pub product_id: u16,
    #[serde(default)]
    pub interface: u8,
    /// Interrupt OUT endpoint address.
    #[serde(default = "default_endpoint")]
    pub endpoint: u8,
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Jobs a device may have queued before new ones are rejected.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// How often the bus is rescanned for hot-plug.  `0` disables rescans.
    #[serde(default = "default_rescan_interval_ms")]
    pub rescan_interval_ms: u64,
    #[serde(default = "default_max_mock_devices")]
    pub max_mock_devices: usize,
}

/// Per-client outbound settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Lines buffered per client before the client is dropped as too slow.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    #[serde(default = "default_session_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    /// `RUST_LOG` takes precedence when set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    5050
}
fn default_max_line_bytes() -> usize {
    64 * 1024
}
fn default_vendor_id() -> u16 {
    0x1BD7
}
fn default_product_id() -> u16 {
    0x5000
}
fn default_endpoint() -> u8 {
    0x02
}
fn default_open_timeout_ms() -> u64 {
    2_000
}
fn default_write_timeout_ms() -> u64 {
    500
}
fn default_queue_depth() -> usize {
    256
}
fn default_rescan_interval_ms() -> u64 {
    2_000
}
fn default_max_mock_devices() -> usize {
    20
}
fn default_outbound_buffer() -> usize {
    256
}
fn default_session_write_timeout_ms() -> u64 {
    2_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            vendor_id: default_vendor_id(),
            product_id: default_product_id(),
            interface: 0,
            endpoint: default_endpoint(),
            open_timeout_ms: default_open_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            queue_depth: default_queue_depth(),
            rescan_interval_ms: default_rescan_interval_ms(),
            max_mock_devices: default_max_mock_devices(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: default_outbound_buffer(),
            write_timeout_ms: default_session_write_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl DeviceConfig {
    pub fn usb_settings(&self) -> UsbSettings {
        UsbSettings {
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            interface: self.interface,
            endpoint: self.endpoint,
        }
    }

    pub fn writer_settings(&self) -> WriterSettings {
        WriterSettings {
            queue_depth: self.queue_depth,
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    /// `None` when hot-plug rescans are disabled.
    pub fn rescan_interval(&self) -> Option<Duration> {
        (self.rescan_interval_ms > 0).then(|| Duration::from_millis(self.rescan_interval_ms))
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Resolves the default config file path.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("config.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads `AppConfig` from `path`, or from the platform default when `None`.
///
/// A missing file yields `AppConfig::default()`.  When no explicit path is
/// given and the platform directory is unknown, defaults are used as well.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match config_file_path() {
            Ok(p) => p,
            Err(ConfigError::NoPlatformConfigDir) => return Ok(AppConfig::default()),
            Err(e) => return Err(e),
        },
    };

    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(e) => Err(ConfigError::Io { path, source: e }),
    }
}

/// Resolves the platform config directory including the `vest-daemon` leaf.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("vest-daemon"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("vest-daemon"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("vest-daemon")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_config_default_listens_on_loopback_5050() {
        // Arrange / Act
        let cfg = AppConfig::default();

        // Assert
        assert_eq!(cfg.network.bind_address, "127.0.0.1");
        assert_eq!(cfg.network.port, 5050);
    }

    #[test]
    fn test_device_config_default_targets_vest_hardware() {
        let cfg = DeviceConfig::default();
        assert_eq!(cfg.vendor_id, 0x1BD7);
        assert_eq!(cfg.product_id, 0x5000);
        assert_eq!(cfg.max_mock_devices, 20);
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: AppConfig = toml::from_str("").expect("deserialize empty");
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_partial_section_overrides_only_named_fields() {
        // Arrange
        let toml_str = r#"
[network]
port = 6060

[device]
rescan_interval_ms = 0
"#;

        // Act
        let cfg: AppConfig = toml::from_str(toml_str).expect("deserialize partial");

        // Assert
        assert_eq!(cfg.network.port, 6060);
        assert_eq!(cfg.network.bind_address, "127.0.0.1");
        assert_eq!(cfg.device.rescan_interval(), None);
        assert_eq!(cfg.device.queue_depth, 256);
    }

    #[test]
    fn test_invalid_toml_returns_parse_error() {
        let dir = std::env::temp_dir().join(format!("vest_cfg_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "[[[ not valid toml").unwrap();

        let result = load_config(Some(&path));

        assert!(matches!(result, Err(ConfigError::Parse(_))));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_config_returns_default_when_file_absent() {
        let path = PathBuf::from("/nonexistent/path/that/cannot/exist/config.toml");
        let cfg = load_config(Some(&path)).expect("missing file is not an error");
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_load_config_reads_explicit_path() {
        // Arrange
        let dir = std::env::temp_dir().join(format!("vest_cfg_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "[logging]\nlevel = \"debug\"\n").unwrap();

        // Act
        let cfg = load_config(Some(&path)).unwrap();

        // Assert
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.network.port, 5050);

        // Cleanup
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_writer_settings_are_derived_from_device_config() {
        let cfg = DeviceConfig {
            queue_depth: 8,
            write_timeout_ms: 50,
            ..DeviceConfig::default()
        };
        let writer = cfg.writer_settings();
        assert_eq!(writer.queue_depth, 8);
        assert_eq!(writer.write_timeout, Duration::from_millis(50));
    }

    #[test]
    fn test_config_file_path_ends_with_config_toml() {
        if let Ok(path) = config_file_path() {
            assert!(path.ends_with("vest-daemon/config.toml") || path.ends_with("config.toml"));
        }
    }
}
