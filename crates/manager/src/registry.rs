//! Device registry
//!
//! The authoritative, deduplicated set of logical devices. Transport events
//! are reconciled in batches; each batch that changes anything publishes one
//! immutable [`RegistrySnapshot`] on a watch channel, so readers never see a
//! half-applied batch. The registry itself is owned by the device manager,
//! which serializes every write.

use protocol::{
    BleAdvertisement, ConnectionState, DeviceError, IdentityKey, LogicalDevice, TransportDetails,
    TransportKind, UsbEndpoint, normalize_ble_address,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// A reconciliation input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// Endpoint newly present on a USB scan
    UsbAttached(UsbEndpoint),
    /// Endpoint no longer present on a USB scan
    UsbDetached(IdentityKey),
    /// First sighting of a supported BLE advertisement
    Advertised {
        key: IdentityKey,
        advertisement: BleAdvertisement,
    },
    /// OS bond state changed for a BLE address
    BondStateChanged { address: String, bonded: bool },
    /// BLE advertisement set cleared for reseeding
    BleCleared,
    /// USB permission granted for a device
    PermissionGranted(IdentityKey),
    /// The session of a device was released
    SessionEnded(IdentityKey),
}

/// Immutable view of the registry after a completed batch
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    generation: u64,
    devices: Arc<Vec<LogicalDevice>>,
}

impl RegistrySnapshot {
    /// Number of batches published before this snapshot
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Devices in discovery order
    pub fn devices(&self) -> &[LogicalDevice] {
        &self.devices
    }

    pub fn get(&self, key: &IdentityKey) -> Option<&LogicalDevice> {
        self.devices.iter().find(|device| device.key == *key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogicalDevice> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[derive(Debug)]
pub struct DeviceRegistry {
    /// Kept in discovery order
    devices: Vec<LogicalDevice>,
    next_seq: u64,
    generation: u64,
    updates: watch::Sender<RegistrySnapshot>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (updates, _) = watch::channel(RegistrySnapshot::default());
        Self {
            devices: Vec::new(),
            next_seq: 0,
            generation: 0,
            updates,
        }
    }

    /// Reconcile a batch of events
    ///
    /// Returns the number of events that changed the registry. A snapshot is
    /// published only when that number is non-zero.
    pub fn apply<I>(&mut self, events: I) -> usize
    where
        I: IntoIterator<Item = RegistryEvent>,
    {
        let mut changed = 0;
        for event in events {
            if self.apply_one(event) {
                changed += 1;
            }
        }

        if changed > 0 {
            self.publish();
            debug!(
                "Reconciled batch: {} changes, generation {}",
                changed, self.generation
            );
        }
        changed
    }

    fn apply_one(&mut self, event: RegistryEvent) -> bool {
        match event {
            RegistryEvent::UsbAttached(endpoint) => self.usb_attached(&endpoint),
            RegistryEvent::UsbDetached(key) => self.mark_offline(&key),
            RegistryEvent::Advertised { key, advertisement } => {
                self.advertised(key, &advertisement)
            }
            RegistryEvent::BondStateChanged { address, bonded } => {
                self.bond_changed(&address, bonded)
            }
            RegistryEvent::BleCleared => self.ble_cleared(),
            RegistryEvent::PermissionGranted(key) => match self.find_mut(&key) {
                Some(device) if device.state == ConnectionState::Discovered => {
                    device.state = ConnectionState::Authorized;
                    info!("Device authorized: {}", key);
                    true
                }
                _ => false,
            },
            RegistryEvent::SessionEnded(key) => match self.find_mut(&key) {
                Some(device) if device.state.is_live() => {
                    device.state = ConnectionState::Disconnected;
                    info!("Session ended: {}", key);
                    true
                }
                _ => false,
            },
        }
    }

    fn usb_attached(&mut self, endpoint: &UsbEndpoint) -> bool {
        let key = endpoint.identity_key();
        match self.find_mut(&key) {
            None => {
                let device = LogicalDevice::from_usb(endpoint, self.next_seq);
                self.next_seq += 1;
                info!(
                    "USB device discovered: {} ({}) at bus={}, addr={}",
                    device.label, key, endpoint.bus_number, endpoint.device_address
                );
                self.devices.push(device);
                true
            }
            Some(device) if device.state == ConnectionState::Offline => {
                device.state = ConnectionState::Discovered;
                device.details = TransportDetails::Usb {
                    bus_number: endpoint.bus_number,
                    device_address: endpoint.device_address,
                    manufacturer: endpoint.manufacturer.clone(),
                };
                info!("USB device reattached: {} ({})", device.label, key);
                true
            }
            // Re-observation never regresses connection state
            Some(_) => false,
        }
    }

    fn advertised(&mut self, key: IdentityKey, advertisement: &BleAdvertisement) -> bool {
        match self.find_mut(&key) {
            None => {
                let device = LogicalDevice::from_ble(key, advertisement, self.next_seq);
                self.next_seq += 1;
                self.devices.push(device);
                true
            }
            Some(device) if device.state == ConnectionState::Offline => {
                device.state = ConnectionState::Authorized;
                if advertisement.bonded.is_some() {
                    device.bonded = advertisement.bonded;
                }
                info!("BLE device back in range: {} ({})", device.label, key);
                true
            }
            Some(device) => match advertisement.bonded {
                Some(bonded) if device.bonded != Some(bonded) => {
                    device.bonded = Some(bonded);
                    true
                }
                _ => false,
            },
        }
    }

    fn bond_changed(&mut self, address: &str, bonded: bool) -> bool {
        let address = normalize_ble_address(address);
        let mut changed = false;
        for device in &mut self.devices {
            if device.key.ble_address() == Some(address.as_str()) && device.bonded != Some(bonded)
            {
                device.bonded = Some(bonded);
                debug!("Bond state of {} is now {}", device.key, bonded);
                changed = true;
            }
        }
        changed
    }

    fn ble_cleared(&mut self) -> bool {
        let mut changed = false;
        for device in &mut self.devices {
            if device.transport() == TransportKind::Ble
                && !device.state.is_live()
                && device.state != ConnectionState::Offline
            {
                device.state = ConnectionState::Offline;
                changed = true;
            }
        }
        changed
    }

    fn mark_offline(&mut self, key: &IdentityKey) -> bool {
        match self.find_mut(key) {
            Some(device) if device.state != ConnectionState::Offline => {
                info!("Device offline: {} (was {})", key, device.state);
                device.state = ConnectionState::Offline;
                true
            }
            _ => false,
        }
    }

    /// Move a device to `to`, enforcing the transition table
    pub fn transition(
        &mut self,
        key: &IdentityKey,
        to: ConnectionState,
    ) -> Result<LogicalDevice, DeviceError> {
        let device = self
            .find_mut(key)
            .ok_or_else(|| DeviceError::UnknownDevice(key.clone()))?;

        if !device.state.can_transition_to(to) {
            return Err(DeviceError::InvalidTransition {
                from: device.state,
                to,
            });
        }

        debug!("{}: {} -> {}", key, device.state, to);
        device.state = to;
        let device = device.clone();
        self.publish();
        Ok(device)
    }

    /// Unregister a device; the returned record is in the terminal state
    pub fn remove(&mut self, key: &IdentityKey) -> Result<LogicalDevice, DeviceError> {
        let index = self
            .devices
            .iter()
            .position(|device| device.key == *key)
            .ok_or_else(|| DeviceError::UnknownDevice(key.clone()))?;

        let mut device = self.devices.remove(index);
        device.state = ConnectionState::Removed;
        self.publish();
        info!("Device removed: {}", key);
        Ok(device)
    }

    pub fn get(&self, key: &IdentityKey) -> Option<&LogicalDevice> {
        self.devices.iter().find(|device| device.key == *key)
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.updates.borrow().clone()
    }

    /// Subscribe to published snapshots
    pub fn subscribe(&self) -> watch::Receiver<RegistrySnapshot> {
        self.updates.subscribe()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    fn find_mut(&mut self, key: &IdentityKey) -> Option<&mut LogicalDevice> {
        self.devices.iter_mut().find(|device| device.key == *key)
    }

    fn publish(&mut self) {
        self.generation += 1;
        self.updates.send_replace(RegistrySnapshot {
            generation: self.generation,
            devices: Arc::new(self.devices.clone()),
        });
    }
}
