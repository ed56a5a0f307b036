//! Device I/O infrastructure.
//!
//! A vest is driven by writing 10-byte packets to a USB interrupt endpoint.
//! Everything above this module talks to two traits:
//!
//! - [`VestBackend`] finds devices on the bus and opens them.
//! - [`VestTransport`] is one open device; it writes packets.
//!
//! The production backend is [`usb::UsbBackend`]; tests and mock devices use
//! [`mock::MockBackend`] / [`mock::MockTransport`].  All writes to one device
//! go through a single writer task owned by a [`handle::DeviceHandle`].

use async_trait::async_trait;
use thiserror::Error;
use vest_core::PACKET_LEN;

use crate::domain::DeviceDescriptor;

pub mod handle;
pub mod mock;
pub mod usb;

pub use handle::{
    Completion, DeviceHandle, DeviceLost, JobSender, SubmitError, WriteError, WriterSettings,
};

/// Errors raised by device discovery, open, and write operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("device not found")]
    NotFound,

    #[error("permission denied opening device")]
    PermissionDenied,

    #[error("device is busy (claimed by another process)")]
    Busy,

    #[error("device disconnected")]
    Disconnected,

    #[error("operation timed out")]
    Timeout,

    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// Maps an OS error from the USB stack onto a transport error.
    pub fn from_io(e: &std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => TransportError::NotFound,
            std::io::ErrorKind::PermissionDenied => TransportError::PermissionDenied,
            std::io::ErrorKind::NotConnected | std::io::ErrorKind::BrokenPipe => {
                TransportError::Disconnected
            }
            std::io::ErrorKind::TimedOut => TransportError::Timeout,
            // EBUSY on Linux and macOS.
            _ if e.raw_os_error() == Some(16) => TransportError::Busy,
            _ => TransportError::Io(e.to_string()),
        }
    }
}

/// One open device.
///
/// Implementations are driven by exactly one writer task, so `&mut self` is
/// enough; no internal locking is needed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VestTransport: Send {
    /// Writes one packet and returns the number of bytes accepted.
    async fn write_packet(&mut self, packet: [u8; PACKET_LEN]) -> Result<usize, TransportError>;

    /// Releases the underlying device.  Further writes fail.
    fn close(&mut self);
}

/// Discovers and opens vest hardware.
#[async_trait]
pub trait VestBackend: Send + Sync {
    /// Lists every attached device matching the configured vendor/product ids.
    ///
    /// This may block on the USB stack; call it from `spawn_blocking`.
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, TransportError>;

    /// Opens the device described by `descriptor`.
    async fn open(
        &self,
        descriptor: &DeviceDescriptor,
    ) -> Result<Box<dyn VestTransport>, TransportError>;
}
