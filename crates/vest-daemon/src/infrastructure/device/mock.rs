//! In-memory devices.
//!
//! Used for two things:
//!
//! - Mock devices created at runtime with `create_mock_device`, so games and
//!   UIs can be developed without a vest plugged in.
//! - Test doubles for hardware: [`MockBackend`] pretends to be the USB bus and
//!   lets tests plug and unplug devices.
//!
//! Every packet a [`MockTransport`] accepts is decoded and recorded on its
//! [`MockProbe`], so tests can assert on exactly what reached the "wire".

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use vest_core::{decode, DecodedPacket, PACKET_LEN};

use super::{TransportError, VestBackend, VestTransport};
use crate::domain::DeviceDescriptor;

/// How many decoded packets a probe keeps.
pub const WRITE_HISTORY: usize = 100;

#[derive(Debug)]
struct ProbeState {
    writes: VecDeque<DecodedPacket>,
    total_writes: u64,
    plugged: bool,
    short_writes: u32,
}

/// Shared view of one mock device.  Clones observe the same device.
#[derive(Debug, Clone)]
pub struct MockProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl MockProbe {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ProbeState {
                writes: VecDeque::with_capacity(WRITE_HISTORY),
                total_writes: 0,
                plugged: true,
                short_writes: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProbeState> {
        // A panic while holding the lock cannot leave the state inconsistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The most recent packets, oldest first.
    pub fn writes(&self) -> Vec<DecodedPacket> {
        self.lock().writes.iter().copied().collect()
    }

    /// `(cell, speed)` of the most recent packets, oldest first.
    pub fn cells_written(&self) -> Vec<(u8, u8)> {
        self.lock()
            .writes
            .iter()
            .map(|p| (p.cell, p.speed))
            .collect()
    }

    pub fn write_count(&self) -> u64 {
        self.lock().total_writes
    }

    pub fn is_plugged(&self) -> bool {
        self.lock().plugged
    }

    /// Every subsequent write fails with `Disconnected`.
    pub fn unplug(&self) {
        self.lock().plugged = false;
    }

    /// The next `n` writes accept only half a packet.
    pub fn fail_next_short(&self, n: u32) {
        self.lock().short_writes = n;
    }
}

impl Default for MockProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// An open mock device.
#[derive(Debug)]
pub struct MockTransport {
    probe: MockProbe,
    closed: bool,
}

impl MockTransport {
    pub fn new(probe: MockProbe) -> Self {
        Self {
            probe,
            closed: false,
        }
    }
}

#[async_trait]
impl VestTransport for MockTransport {
    async fn write_packet(&mut self, packet: [u8; PACKET_LEN]) -> Result<usize, TransportError> {
        if self.closed {
            return Err(TransportError::Disconnected);
        }
        let mut state = self.probe.lock();
        if !state.plugged {
            return Err(TransportError::Disconnected);
        }
        if state.short_writes > 0 {
            state.short_writes -= 1;
            return Ok(PACKET_LEN / 2);
        }

        let decoded = decode(&packet).map_err(|e| TransportError::Io(e.to_string()))?;
        if state.writes.len() == WRITE_HISTORY {
            state.writes.pop_front();
        }
        state.writes.push_back(decoded);
        state.total_writes += 1;
        Ok(PACKET_LEN)
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// A fake USB bus.
#[derive(Debug, Default)]
pub struct MockBackend {
    devices: Mutex<Vec<(DeviceDescriptor, MockProbe)>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn devices(&self) -> MutexGuard<'_, Vec<(DeviceDescriptor, MockProbe)>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attaches a device to the bus and returns its probe.
    pub fn plug(&self, descriptor: DeviceDescriptor) -> MockProbe {
        let probe = MockProbe::new();
        self.devices().push((descriptor, probe.clone()));
        probe
    }

    /// Detaches a device.  Open transports start failing immediately.
    pub fn unplug(&self, descriptor: &DeviceDescriptor) -> bool {
        let mut devices = self.devices();
        let before = devices.len();
        devices.retain(|(d, probe)| {
            let hit = d.same_device(descriptor);
            if hit {
                probe.unplug();
            }
            !hit
        });
        devices.len() != before
    }

    pub fn probe(&self, descriptor: &DeviceDescriptor) -> Option<MockProbe> {
        self.devices()
            .iter()
            .find(|(d, _)| d.same_device(descriptor))
            .map(|(_, p)| p.clone())
    }
}

#[async_trait]
impl VestBackend for MockBackend {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        Ok(self.devices().iter().map(|(d, _)| d.clone()).collect())
    }

    async fn open(
        &self,
        descriptor: &DeviceDescriptor,
    ) -> Result<Box<dyn VestTransport>, TransportError> {
        let probe = self.probe(descriptor).ok_or(TransportError::NotFound)?;
        Ok(Box::new(MockTransport::new(probe)))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
