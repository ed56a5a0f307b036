//! USB backend built on `nusb`.
//!
//! Discovery filters the bus by vendor/product id.  Opening a device claims
//! the configured interface; writes are single interrupt OUT transfers of one
//! packet each.
//!
//! `nusb` talks to the OS directly (usbfs on Linux, IOKit on macOS, WinUSB on
//! Windows), so no libusb install is needed.  Enumeration and `open` are
//! blocking syscalls and run on the blocking thread pool.

use async_trait::async_trait;
use nusb::transfer::TransferError;
use tracing::debug;
use vest_core::PACKET_LEN;

use super::{TransportError, VestBackend, VestTransport};
use crate::domain::DeviceDescriptor;

/// Which devices to look for and how to talk to them.
#[derive(Debug, Clone, Copy)]
pub struct UsbSettings {
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface: u8,
    pub endpoint: u8,
}

/// The real USB bus.
#[derive(Debug, Clone)]
pub struct UsbBackend {
    settings: UsbSettings,
}

impl UsbBackend {
    pub fn new(settings: UsbSettings) -> Self {
        Self { settings }
    }

    fn matching(&self) -> Result<Vec<nusb::DeviceInfo>, TransportError> {
        let devices = nusb::list_devices().map_err(|e| TransportError::from_io(&e))?;
        Ok(devices
            .filter(|d| {
                d.vendor_id() == self.settings.vendor_id
                    && d.product_id() == self.settings.product_id
            })
            .collect())
    }
}

fn describe(info: &nusb::DeviceInfo) -> DeviceDescriptor {
    DeviceDescriptor {
        bus: Some(info.bus_number()),
        address: Some(info.device_address()),
        serial_number: info.serial_number().map(str::to_owned),
        vendor_id: info.vendor_id(),
        product_id: info.product_id(),
    }
}

#[async_trait]
impl VestBackend for UsbBackend {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        Ok(self.matching()?.iter().map(describe).collect())
    }

    async fn open(
        &self,
        descriptor: &DeviceDescriptor,
    ) -> Result<Box<dyn VestTransport>, TransportError> {
        let backend = self.clone();
        let wanted = descriptor.clone();

        let interface = tokio::task::spawn_blocking(move || {
            let info = backend
                .matching()?
                .into_iter()
                .find(|info| describe(info).same_device(&wanted))
                .ok_or(TransportError::NotFound)?;
            let device = info.open().map_err(|e| TransportError::from_io(&e))?;
            device
                .claim_interface(backend.settings.interface)
                .map_err(|e| TransportError::from_io(&e))
        })
        .await
        .map_err(|e| TransportError::Io(format!("open task failed: {e}")))??;

        debug!(
            "usb: opened bus {:?} address {:?}",
            descriptor.bus, descriptor.address
        );
        Ok(Box::new(UsbTransport {
            interface: Some(interface),
            endpoint: self.settings.endpoint,
        }))
    }
}

/// A claimed vest interface.
pub struct UsbTransport {
    interface: Option<nusb::Interface>,
    endpoint: u8,
}

#[async_trait]
impl VestTransport for UsbTransport {
    async fn write_packet(&mut self, packet: [u8; PACKET_LEN]) -> Result<usize, TransportError> {
        let interface = self.interface.as_ref().ok_or(TransportError::Disconnected)?;
        let completion = interface
            .interrupt_out(self.endpoint, packet.to_vec())
            .await;

        match completion.status {
            Ok(()) => Ok(completion.data.actual_length()),
            Err(TransferError::Disconnected) => Err(TransportError::Disconnected),
            Err(TransferError::Cancelled) => Err(TransportError::Timeout),
            Err(e) => Err(TransportError::Io(e.to_string())),
        }
    }

    fn close(&mut self) {
        // Dropping the interface releases the claim.
        self.interface = None;
    }
}
