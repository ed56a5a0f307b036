//! Device registry: every known device, its connection state, and the main
//! device pointer.
//!
//! The registry is plain data.  It never performs I/O; the command router
//! opens transports and hands the resulting [`DeviceHandle`] back here.  This
//! keeps the registry usable under a lock that is never held across an
//! `await`.
//!
//! # Main device
//!
//! At most one device is *main*.  Effect commands with no explicit target
//! land on it.  The first device registered becomes main automatically, and
//! removing the main device promotes the earliest remaining one.

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use crate::domain::{CommandError, ConnectionState, DeviceDescriptor, DeviceId};
use crate::infrastructure::device::mock::MockProbe;
use crate::infrastructure::device::DeviceHandle;

/// USB ids reported by mock devices.
pub const MOCK_VENDOR_ID: u16 = 0x1234;
pub const MOCK_PRODUCT_ID: u16 = 0x5678;

/// Error type for registry operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device not found: {0}")]
    NotFound(DeviceId),

    #[error("not a mock device: {0}")]
    NotMock(DeviceId),

    #[error("mock device limit reached ({0})")]
    MockLimit(usize),
}

impl From<DeviceError> for CommandError {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::NotFound(_) => CommandError::NotFound(e.to_string()),
            DeviceError::NotMock(_) => CommandError::Parameter(e.to_string()),
            DeviceError::MockLimit(_) => CommandError::Conflict(e.to_string()),
        }
    }
}

/// Whether a device is real hardware or simulated.
#[derive(Debug, Clone)]
pub enum DeviceKind {
    Hardware,
    Mock(MockProbe),
}

/// One registered device.
#[derive(Debug)]
pub struct DeviceEntry {
    pub device_id: DeviceId,
    pub descriptor: DeviceDescriptor,
    pub kind: DeviceKind,
    pub state: ConnectionState,
    handle: Option<DeviceHandle>,
    /// Present only while `Connecting`; dropping it wakes every waiter.
    opening: Option<watch::Sender<()>>,
    seq: u64,
}

impl DeviceEntry {
    pub fn is_mock(&self) -> bool {
        matches!(self.kind, DeviceKind::Mock(_))
    }

    /// The writer handle, present only while `Connected`.
    pub fn handle(&self) -> Option<&DeviceHandle> {
        self.handle.as_ref()
    }
}

/// Snapshot of one device as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSummary {
    pub device_id: DeviceId,
    pub is_main: bool,
    pub is_mock: bool,
    pub state: ConnectionState,
    pub device: DeviceDescriptor,
}

/// What the caller must do after [`DeviceRegistry::begin_connect`].
#[derive(Debug, Clone)]
pub enum ConnectPlan {
    /// The device already has a writer.
    AlreadyConnected,
    /// Another caller is opening the device.  The receiver reports an error
    /// once that open has settled; call `begin_connect` again then.
    InProgress(watch::Receiver<()>),
    /// The device is now `Connecting`; open a transport for it.
    Open {
        descriptor: DeviceDescriptor,
        kind: DeviceKind,
    },
}

/// All known devices keyed by id.
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: HashMap<DeviceId, DeviceEntry>,
    main: Option<DeviceId>,
    next_seq: u64,
    mocks_created: u32,
    max_mocks: usize,
}

impl DeviceRegistry {
    pub fn new(max_mocks: usize) -> Self {
        Self {
            devices: HashMap::new(),
            main: None,
            next_seq: 0,
            mocks_created: 0,
            max_mocks,
        }
    }

    pub fn get(&self, id: &DeviceId) -> Option<&DeviceEntry> {
        self.devices.get(id)
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn main(&self) -> Option<&DeviceId> {
        self.main.as_ref()
    }

    fn insert(&mut self, device_id: DeviceId, descriptor: DeviceDescriptor, kind: DeviceKind) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if self.main.is_none() {
            self.main = Some(device_id.clone());
        }
        self.devices.insert(
            device_id.clone(),
            DeviceEntry {
                device_id,
                descriptor,
                kind,
                state: ConnectionState::Disconnected,
                handle: None,
                opening: None,
                seq,
            },
        );
    }

    /// Registers a discovered hardware device, reusing an existing entry for
    /// the same physical device.  Returns the id and whether it is new.
    pub fn register_hardware(&mut self, descriptor: DeviceDescriptor) -> (DeviceId, bool) {
        let existing = self
            .devices
            .values_mut()
            .find(|e| !e.is_mock() && e.descriptor.same_device(&descriptor));
        if let Some(entry) = existing {
            // A replugged device keeps its serial but may get a new address.
            if entry.state == ConnectionState::Disconnected {
                entry.descriptor = descriptor;
            }
            return (entry.device_id.clone(), false);
        }

        let device_id = DeviceId::generate_hardware();
        self.insert(device_id.clone(), descriptor, DeviceKind::Hardware);
        (device_id, true)
    }

    /// Registers a new mock device.  The caller connects it.
    pub fn register_mock(&mut self) -> Result<DeviceId, DeviceError> {
        let mocks = self.devices.values().filter(|e| e.is_mock()).count();
        if mocks >= self.max_mocks {
            return Err(DeviceError::MockLimit(self.max_mocks));
        }

        self.mocks_created += 1;
        let descriptor = DeviceDescriptor {
            bus: None,
            address: None,
            serial_number: Some(format!("MOCK-{:03}", self.mocks_created)),
            vendor_id: MOCK_VENDOR_ID,
            product_id: MOCK_PRODUCT_ID,
        };
        let device_id = DeviceId::generate_mock();
        self.insert(
            device_id.clone(),
            descriptor,
            DeviceKind::Mock(MockProbe::new()),
        );
        Ok(device_id)
    }

    /// Removes a device.  Dropping the returned entry cancels its writer.
    pub fn remove(&mut self, id: &DeviceId) -> Result<DeviceEntry, DeviceError> {
        let entry = self
            .devices
            .remove(id)
            .ok_or_else(|| DeviceError::NotFound(id.clone()))?;

        if self.main.as_ref() == Some(id) {
            self.main = self
                .devices
                .values()
                .min_by_key(|e| e.seq)
                .map(|e| e.device_id.clone());
        }
        Ok(entry)
    }

    pub fn set_main(&mut self, id: &DeviceId) -> Result<(), DeviceError> {
        if !self.contains(id) {
            return Err(DeviceError::NotFound(id.clone()));
        }
        self.main = Some(id.clone());
        Ok(())
    }

    /// Clears the main pointer and returns the previous main device.
    pub fn clear_main(&mut self) -> Option<DeviceId> {
        self.main.take()
    }

    pub fn summary(&self, id: &DeviceId) -> Option<DeviceSummary> {
        self.devices.get(id).map(|e| DeviceSummary {
            device_id: e.device_id.clone(),
            is_main: self.main.as_ref() == Some(&e.device_id),
            is_mock: e.is_mock(),
            state: e.state,
            device: e.descriptor.clone(),
        })
    }

    /// Every device in registration order.
    pub fn list(&self) -> Vec<DeviceSummary> {
        let mut entries: Vec<&DeviceEntry> = self.devices.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries
            .into_iter()
            .filter_map(|e| self.summary(&e.device_id))
            .collect()
    }

    /// Hardware entries that currently own a writer.
    pub fn connected_hardware(&self) -> Vec<(DeviceId, DeviceDescriptor)> {
        self.devices
            .values()
            .filter(|e| !e.is_mock() && e.state == ConnectionState::Connected)
            .map(|e| (e.device_id.clone(), e.descriptor.clone()))
            .collect()
    }

    pub fn any_connected(&self) -> bool {
        self.devices
            .values()
            .any(|e| e.state == ConnectionState::Connected)
    }

    // ── Connection state machine ──────────────────────────────────────────────

    /// Moves a `Disconnected` device to `Connecting`.
    pub fn begin_connect(&mut self, id: &DeviceId) -> Result<ConnectPlan, DeviceError> {
        let entry = self
            .devices
            .get_mut(id)
            .ok_or_else(|| DeviceError::NotFound(id.clone()))?;

        match entry.state {
            ConnectionState::Connected => Ok(ConnectPlan::AlreadyConnected),
            ConnectionState::Connecting => {
                let opening = entry.opening.get_or_insert_with(|| watch::channel(()).0);
                Ok(ConnectPlan::InProgress(opening.subscribe()))
            }
            ConnectionState::Disconnected => {
                entry.state = ConnectionState::Connecting;
                entry.opening = Some(watch::channel(()).0);
                Ok(ConnectPlan::Open {
                    descriptor: entry.descriptor.clone(),
                    kind: entry.kind.clone(),
                })
            }
        }
    }

    /// Installs the writer of a successful open.
    ///
    /// Returns `false` (and drops `handle`) if the device was removed or
    /// disconnected while the open was in flight.
    pub fn finish_connect(&mut self, id: &DeviceId, handle: DeviceHandle) -> bool {
        match self.devices.get_mut(id) {
            Some(entry) if entry.state == ConnectionState::Connecting => {
                entry.handle = Some(handle);
                entry.state = ConnectionState::Connected;
                entry.opening = None;
                true
            }
            _ => false,
        }
    }

    /// Returns a `Connecting` device to `Disconnected` after a failed open.
    pub fn abort_connect(&mut self, id: &DeviceId) {
        if let Some(entry) = self.devices.get_mut(id) {
            if entry.state == ConnectionState::Connecting {
                entry.state = ConnectionState::Disconnected;
                entry.opening = None;
            }
        }
    }

    /// Drops the writer and marks the device `Disconnected`.
    ///
    /// Returns whether the device had been connected.
    pub fn disconnect(&mut self, id: &DeviceId) -> Result<bool, DeviceError> {
        let entry = self
            .devices
            .get_mut(id)
            .ok_or_else(|| DeviceError::NotFound(id.clone()))?;
        let was_connected = entry.state == ConnectionState::Connected;
        entry.handle = None;
        entry.opening = None;
        entry.state = ConnectionState::Disconnected;
        Ok(was_connected)
    }

    /// Handles an asynchronous write failure.
    ///
    /// Only applies when `connection_id` matches the current writer; a report
    /// about an earlier connection is ignored.
    pub fn mark_lost(&mut self, id: &DeviceId, connection_id: u64) -> bool {
        let Some(entry) = self.devices.get_mut(id) else {
            return false;
        };
        let current = entry.handle.as_ref().map(DeviceHandle::connection_id);
        if current != Some(connection_id) {
            return false;
        }
        entry.handle = None;
        entry.state = ConnectionState::Disconnected;
        true
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::infrastructure::device::mock::MockTransport;
    use crate::infrastructure::device::WriterSettings;

    fn hw(bus: u8, address: u8, serial: Option<&str>) -> DeviceDescriptor {
        DeviceDescriptor {
            bus: Some(bus),
            address: Some(address),
            serial_number: serial.map(str::to_owned),
            vendor_id: 0x1BD7,
            product_id: 0x5000,
        }
    }

    fn mock_handle(id: &DeviceId) -> DeviceHandle {
        let (lost_tx, _lost_rx) = mpsc::unbounded_channel();
        DeviceHandle::spawn(
            id.clone(),
            Box::new(MockTransport::new(MockProbe::new())),
            WriterSettings::default(),
            lost_tx,
        )
    }

    #[test]
    fn test_first_registered_device_becomes_main() {
        // Arrange
        let mut registry = DeviceRegistry::new(20);

        // Act
        let (first, new_first) = registry.register_hardware(hw(1, 5, None));
        let (_second, _) = registry.register_hardware(hw(1, 6, None));

        // Assert
        assert!(new_first);
        assert_eq!(registry.main(), Some(&first));
        assert!(first.as_str().starts_with("device_"));
    }

    #[test]
    fn test_reregistering_same_serial_reuses_entry_and_updates_address() {
        let mut registry = DeviceRegistry::new(20);
        let (id, _) = registry.register_hardware(hw(1, 5, Some("SN1")));

        let (again, is_new) = registry.register_hardware(hw(2, 9, Some("SN1")));

        assert_eq!(id, again);
        assert!(!is_new);
        assert_eq!(registry.get(&id).unwrap().descriptor.address, Some(9));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_mock_devices_get_sequential_serials_and_mock_ids() {
        let mut registry = DeviceRegistry::new(20);

        let a = registry.register_mock().unwrap();
        let b = registry.register_mock().unwrap();

        let a = registry.get(&a).unwrap();
        let b = registry.get(&b).unwrap();
        assert!(a.device_id.as_str().starts_with("mock_"));
        assert_eq!(a.descriptor.serial_number.as_deref(), Some("MOCK-001"));
        assert_eq!(b.descriptor.serial_number.as_deref(), Some("MOCK-002"));
        assert_eq!(a.descriptor.vendor_id, MOCK_VENDOR_ID);
        assert!(a.is_mock());
    }

    #[test]
    fn test_mock_limit_is_enforced() {
        let mut registry = DeviceRegistry::new(2);
        registry.register_mock().unwrap();
        registry.register_mock().unwrap();

        assert_eq!(registry.register_mock(), Err(DeviceError::MockLimit(2)));
    }

    #[test]
    fn test_removing_main_promotes_earliest_remaining_device() {
        // Arrange
        let mut registry = DeviceRegistry::new(20);
        let a = registry.register_mock().unwrap();
        let b = registry.register_mock().unwrap();
        let c = registry.register_mock().unwrap();
        registry.set_main(&c).unwrap();

        // Act
        registry.remove(&c).unwrap();

        // Assert
        assert_eq!(registry.main(), Some(&a));
        registry.remove(&a).unwrap();
        assert_eq!(registry.main(), Some(&b));
        registry.remove(&b).unwrap();
        assert_eq!(registry.main(), None);
    }

    #[test]
    fn test_at_most_one_main_in_listing() {
        let mut registry = DeviceRegistry::new(20);
        let _a = registry.register_mock().unwrap();
        let b = registry.register_mock().unwrap();
        registry.set_main(&b).unwrap();

        let list = registry.list();

        assert_eq!(list.iter().filter(|d| d.is_main).count(), 1);
        assert_eq!(list[1].device_id, b);
        assert!(list[1].is_main);
    }

    #[test]
    fn test_set_main_rejects_unknown_device() {
        let mut registry = DeviceRegistry::new(20);
        let unknown = DeviceId::new("mock_nope");
        assert_eq!(
            registry.set_main(&unknown),
            Err(DeviceError::NotFound(unknown))
        );
    }

    #[tokio::test]
    async fn test_connect_state_machine() {
        // Arrange
        let mut registry = DeviceRegistry::new(20);
        let (id, _) = registry.register_hardware(hw(1, 5, None));

        // Act / Assert: Disconnected → Connecting
        assert!(matches!(
            registry.begin_connect(&id),
            Ok(ConnectPlan::Open { .. })
        ));
        assert_eq!(registry.get(&id).unwrap().state, ConnectionState::Connecting);
        let Ok(ConnectPlan::InProgress(mut waiter)) = registry.begin_connect(&id) else {
            panic!("a second caller must wait for the open in progress");
        };

        // Connecting → Connected, which releases the waiter
        assert!(registry.finish_connect(&id, mock_handle(&id)));
        assert!(waiter.changed().await.is_err());
        assert_eq!(registry.get(&id).unwrap().state, ConnectionState::Connected);
        assert!(matches!(
            registry.begin_connect(&id),
            Ok(ConnectPlan::AlreadyConnected)
        ));

        // Connected → Disconnected
        assert_eq!(registry.disconnect(&id), Ok(true));
        assert!(registry.get(&id).unwrap().handle().is_none());
    }

    #[tokio::test]
    async fn test_finish_connect_after_disconnect_is_discarded() {
        let mut registry = DeviceRegistry::new(20);
        let (id, _) = registry.register_hardware(hw(1, 5, None));
        registry.begin_connect(&id).unwrap();

        registry.disconnect(&id).unwrap();
        let installed = registry.finish_connect(&id, mock_handle(&id));

        assert!(!installed);
        assert_eq!(registry.get(&id).unwrap().state, ConnectionState::Disconnected);
    }

    #[test]
    fn test_abort_connect_returns_to_disconnected() {
        let mut registry = DeviceRegistry::new(20);
        let (id, _) = registry.register_hardware(hw(1, 5, None));
        registry.begin_connect(&id).unwrap();

        registry.abort_connect(&id);

        assert_eq!(registry.get(&id).unwrap().state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_mark_lost_ignores_stale_connection_ids() {
        // Arrange
        let mut registry = DeviceRegistry::new(20);
        let (id, _) = registry.register_hardware(hw(1, 5, None));
        registry.begin_connect(&id).unwrap();
        let handle = mock_handle(&id);
        let current = handle.connection_id();
        registry.finish_connect(&id, handle);

        // Act
        let stale = registry.mark_lost(&id, current + 1000);
        let fresh = registry.mark_lost(&id, current);

        // Assert
        assert!(!stale);
        assert!(fresh);
        assert_eq!(registry.get(&id).unwrap().state, ConnectionState::Disconnected);
    }
}
