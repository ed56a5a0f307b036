//! Device identity, USB descriptors, and connection state.
//!
//! # Connection lifecycle (for beginners)
//!
//! ```text
//! Disconnected ──connect──► Connecting ──open ok──► Connected
//!      ▲                        │                       │
//!      └────── open failure ────┘                       │
//!      └──── disconnect / hot-unplug / write failure ───┘
//! ```
//!
//! A device that is `Connected` owns a writer task; every other state owns
//! nothing and can be connected again later.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque registry key for one device.
///
/// Hardware devices are named `device_<8 hex>`, mock devices `mock_<8 hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh id for a physical device.
    pub fn generate_hardware() -> Self {
        Self(format!("device_{}", short_hex()))
    }

    /// A fresh id for a mock device.
    pub fn generate_mock() -> Self {
        Self(format!("mock_{}", short_hex()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn short_hex() -> String {
    let mut hex = Uuid::new_v4().simple().to_string();
    hex.truncate(8);
    hex
}

/// Where a device lives on the USB bus and what it claims to be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub bus: Option<u8>,
    pub address: Option<u8>,
    pub serial_number: Option<String>,
    #[serde(with = "hex_id")]
    pub vendor_id: u16,
    #[serde(with = "hex_id")]
    pub product_id: u16,
}

impl DeviceDescriptor {
    /// True when both descriptors name the same physical device.
    ///
    /// A serial number match wins; otherwise bus and address must both match.
    pub fn same_device(&self, other: &DeviceDescriptor) -> bool {
        if let (Some(a), Some(b)) = (&self.serial_number, &other.serial_number) {
            return a == b;
        }
        self.bus.is_some()
            && self.address.is_some()
            && self.bus == other.bus
            && self.address == other.address
    }
}

/// How a client picks a device in `select_device`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    BusAddress { bus: u8, address: u8 },
    Serial(String),
}

impl DeviceSelector {
    pub fn matches(&self, descriptor: &DeviceDescriptor) -> bool {
        match self {
            DeviceSelector::BusAddress { bus, address } => {
                descriptor.bus == Some(*bus) && descriptor.address == Some(*address)
            }
            DeviceSelector::Serial(serial) => {
                descriptor.serial_number.as_deref() == Some(serial.as_str())
            }
        }
    }
}

/// Connection state of a registered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// USB ids travel as `"0x1bd7"` strings so UIs can show them verbatim.
mod hex_id {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u16, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{value:04x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
        let text = String::deserialize(deserializer)?;
        let digits = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
            .unwrap_or(&text);
        u16::from_str_radix(digits, 16).map_err(de::Error::custom)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
