//! Device and transport type definitions
//!
//! This module defines the types shared by every layer of the device manager:
//! transport endpoints as reported by the OS, the logical device record kept in
//! the registry, connection states and the timeout classes used by sessions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Budget for autonomous calls that complete without user action (4 seconds)
pub const TIMEOUT_AUTONOMOUS: Duration = Duration::from_millis(4_000);

/// Budget for autonomous calls with heavier on-device computation (8 seconds)
pub const TIMEOUT_AUTONOMOUS_LONG: Duration = Duration::from_millis(8_000);

/// Budget for calls that wait on a confirmation at the device (2 minutes)
pub const TIMEOUT_USER_INTERACTION: Duration = Duration::from_millis(120_000);

/// USB device class code for hubs
pub const USB_CLASS_HUB: u8 = 0x09;

/// Transport a device is reachable over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    Usb,
    Ble,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Usb => write!(f, "USB"),
            TransportKind::Ble => write!(f, "BLE"),
        }
    }
}

/// Stable identity of a physical device
///
/// Derived from the transport address: vendor/product/serial for USB,
/// advertised service and address for BLE. Two observations with the same
/// key always refer to the same logical device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdentityKey {
    Usb {
        vendor_id: u16,
        product_id: u16,
        serial_number: Option<String>,
    },
    Ble {
        service: Uuid,
        address: String,
    },
}

impl IdentityKey {
    /// Transport this key was derived from
    pub fn transport(&self) -> TransportKind {
        match self {
            IdentityKey::Usb { .. } => TransportKind::Usb,
            IdentityKey::Ble { .. } => TransportKind::Ble,
        }
    }

    /// BLE address, if this is a BLE key
    pub fn ble_address(&self) -> Option<&str> {
        match self {
            IdentityKey::Ble { address, .. } => Some(address),
            IdentityKey::Usb { .. } => None,
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityKey::Usb {
                vendor_id,
                product_id,
                serial_number,
            } => {
                write!(f, "usb:{:04x}:{:04x}", vendor_id, product_id)?;
                if let Some(serial) = serial_number {
                    write!(f, ":{}", serial)?;
                }
                Ok(())
            }
            IdentityKey::Ble { service, address } => write!(f, "ble:{}@{}", service, address),
        }
    }
}

/// Normalize a BLE address to the canonical upper-case form
pub fn normalize_ble_address(address: &str) -> String {
    address.trim().to_ascii_uppercase()
}

/// Raw USB endpoint as enumerated from the OS
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbEndpoint {
    /// Bus number
    pub bus_number: u8,
    /// Device address on the bus
    pub device_address: u8,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// USB device class
    pub class: u8,
    /// Serial number string (if readable)
    pub serial_number: Option<String>,
    /// Manufacturer string (if readable)
    pub manufacturer: Option<String>,
    /// Product string (if readable)
    pub product: Option<String>,
}

impl UsbEndpoint {
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::Usb {
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            serial_number: self.serial_number.clone(),
        }
    }

    /// OS location of the endpoint, stable for one attachment
    pub fn location(&self) -> (u8, u8) {
        (self.bus_number, self.device_address)
    }

    /// Human label: product string, else the VID:PID pair
    pub fn label(&self) -> String {
        match &self.product {
            Some(product) if !product.trim().is_empty() => product.trim().to_string(),
            _ => format!("USB device {:04x}:{:04x}", self.vendor_id, self.product_id),
        }
    }

    /// Root hubs are never signing devices
    pub fn is_root_hub(&self) -> bool {
        self.vendor_id == 0x1d6b && self.class == USB_CLASS_HUB
    }
}

/// A BLE advertisement as observed by the OS scanner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleAdvertisement {
    /// Peripheral address
    pub address: String,
    /// Advertised local name
    pub name: Option<String>,
    /// Advertised service UUIDs
    pub service_uuids: Vec<Uuid>,
    /// Bond state reported alongside the advertisement, if known
    pub bonded: Option<bool>,
}

impl BleAdvertisement {
    /// Derive the identity key from the first advertised service in `supported`
    ///
    /// Returns `None` when the advertisement carries no supported service.
    pub fn identity_key(&self, supported: &[Uuid]) -> Option<IdentityKey> {
        let service = self
            .service_uuids
            .iter()
            .find(|uuid| supported.contains(uuid))?;

        Some(IdentityKey::Ble {
            service: *service,
            address: normalize_ble_address(&self.address),
        })
    }

    pub fn label(&self) -> String {
        match &self.name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => format!("BLE device {}", normalize_ble_address(&self.address)),
        }
    }
}

/// Connection lifecycle of a logical device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Known, not yet connectable (USB permission not granted)
    Discovered,
    /// Permission granted or pairable
    Authorized,
    /// Channel being opened
    Connecting,
    /// Session live
    Connected,
    /// Session released while the device is still present
    Disconnected,
    /// Transport lost; entry retained for reattachment
    Offline,
    /// Explicitly unregistered (terminal)
    Removed,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal transition
    ///
    /// Any live state may fall back to `Offline` since hardware can vanish at any
    /// time. Forward transitions require the preceding state.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::{
            Authorized, Connected, Connecting, Disconnected, Discovered, Offline, Removed,
        };

        match (self, next) {
            (Removed, _) => false,
            (_, Removed) => true,
            (Offline, Offline) => false,
            (_, Offline) => true,
            (Discovered, Authorized) => true,
            (Authorized | Disconnected, Connecting) => true,
            (Connecting, Connected | Authorized | Disconnected) => true,
            (Connected, Disconnected) => true,
            (Offline, Discovered | Authorized) => true,
            _ => false,
        }
    }

    /// Whether a session may be opened from this state
    pub fn is_connectable(self) -> bool {
        matches!(
            self,
            ConnectionState::Authorized | ConnectionState::Disconnected
        )
    }

    /// Whether a session is being opened or is open
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Discovered => "discovered",
            ConnectionState::Authorized => "authorized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Offline => "offline",
            ConnectionState::Removed => "removed",
        };
        f.write_str(name)
    }
}

/// Transport-specific metadata of a logical device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportDetails {
    Usb {
        /// Bus number of the last attachment
        bus_number: u8,
        /// Device address of the last attachment
        device_address: u8,
        /// Manufacturer string (if readable)
        manufacturer: Option<String>,
    },
    Ble {
        /// Advertised local name
        name: Option<String>,
    },
}

/// A device as understood by the application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalDevice {
    /// Stable identity
    pub key: IdentityKey,
    /// Human label
    pub label: String,
    /// Current connection state
    pub state: ConnectionState,
    /// Last known bond state (BLE only)
    pub bonded: Option<bool>,
    /// Transport-specific metadata
    pub details: TransportDetails,
    /// Discovery order, stable across reconciliation
    pub discovery_seq: u64,
}

impl LogicalDevice {
    /// Create a USB device in the `Discovered` state
    pub fn from_usb(endpoint: &UsbEndpoint, discovery_seq: u64) -> Self {
        Self {
            key: endpoint.identity_key(),
            label: endpoint.label(),
            state: ConnectionState::Discovered,
            bonded: None,
            details: TransportDetails::Usb {
                bus_number: endpoint.bus_number,
                device_address: endpoint.device_address,
                manufacturer: endpoint.manufacturer.clone(),
            },
            discovery_seq,
        }
    }

    /// Create a BLE device in the `Authorized` state
    pub fn from_ble(key: IdentityKey, advertisement: &BleAdvertisement, discovery_seq: u64) -> Self {
        Self {
            key,
            label: advertisement.label(),
            state: ConnectionState::Authorized,
            bonded: advertisement.bonded,
            details: TransportDetails::Ble {
                name: advertisement.name.clone(),
            },
            discovery_seq,
        }
    }

    pub fn transport(&self) -> TransportKind {
        self.key.transport()
    }

    /// Rebuild the USB endpoint of the last attachment
    pub fn usb_endpoint(&self) -> Option<UsbEndpoint> {
        match (&self.key, &self.details) {
            (
                IdentityKey::Usb {
                    vendor_id,
                    product_id,
                    serial_number,
                },
                TransportDetails::Usb {
                    bus_number,
                    device_address,
                    manufacturer,
                },
            ) => Some(UsbEndpoint {
                bus_number: *bus_number,
                device_address: *device_address,
                vendor_id: *vendor_id,
                product_id: *product_id,
                class: 0,
                serial_number: serial_number.clone(),
                manufacturer: manufacturer.clone(),
                product: Some(self.label.clone()),
            }),
            _ => None,
        }
    }
}

/// Timeout class of a request, selected per request kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeoutClass {
    /// Completes without user action
    Autonomous,
    /// Autonomous with heavier on-device computation
    AutonomousLong,
    /// Blocks on a human confirmation at the device
    UserInteraction,
    /// Never times out; the caller owns cancellation
    None,
}

impl TimeoutClass {
    /// Default budget of this class, `None` for the unbounded class
    pub fn default_budget(self) -> Option<Duration> {
        match self {
            TimeoutClass::Autonomous => Some(TIMEOUT_AUTONOMOUS),
            TimeoutClass::AutonomousLong => Some(TIMEOUT_AUTONOMOUS_LONG),
            TimeoutClass::UserInteraction => Some(TIMEOUT_USER_INTERACTION),
            TimeoutClass::None => None,
        }
    }

    /// Whether a request of this class is safe to retry blindly
    ///
    /// A user-interaction request may still be pending on the device.
    pub fn is_retry_safe(self) -> bool {
        matches!(self, TimeoutClass::Autonomous | TimeoutClass::AutonomousLong)
    }
}

impl fmt::Display for TimeoutClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimeoutClass::Autonomous => "autonomous",
            TimeoutClass::AutonomousLong => "autonomous-long",
            TimeoutClass::UserInteraction => "user-interaction",
            TimeoutClass::None => "none",
        };
        f.write_str(name)
    }
}

/// Correlation token of a permission request
///
/// Monotonically unique per gateway; disambiguates overlapping requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationToken(pub u64);

/// Request ID for matching session responses to requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

#[cfg(test)]
mod tests {
    use super::*;

    const JADE_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
    const OTHER_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);

    fn endpoint(product: Option<&str>) -> UsbEndpoint {
        UsbEndpoint {
            bus_number: 1,
            device_address: 4,
            vendor_id: 0x10c4,
            product_id: 0xea60,
            class: 0,
            serial_number: Some("JADE01".to_string()),
            manufacturer: Some("Blockstream".to_string()),
            product: product.map(str::to_string),
        }
    }

    #[test]
    fn test_usb_identity_ignores_location() {
        let a = endpoint(None);
        let mut b = endpoint(None);
        b.bus_number = 3;
        b.device_address = 17;
        assert_eq!(a.identity_key(), b.identity_key());
        assert_ne!(a.location(), b.location());
    }

    #[test]
    fn test_usb_label_fallback() {
        assert_eq!(endpoint(Some("Jade")).label(), "Jade");
        assert_eq!(endpoint(Some("  ")).label(), "USB device 10c4:ea60");
        assert_eq!(endpoint(None).label(), "USB device 10c4:ea60");
    }

    #[test]
    fn test_identity_key_display() {
        let key = endpoint(None).identity_key();
        assert_eq!(key.to_string(), "usb:10c4:ea60:JADE01");
        assert_eq!(key.transport(), TransportKind::Usb);
    }

    #[test]
    fn test_ble_identity_uses_supported_service() {
        let adv = BleAdvertisement {
            address: "aa:bb:cc:dd:ee:ff".to_string(),
            name: Some("Jade ABC123".to_string()),
            service_uuids: vec![OTHER_SERVICE, JADE_SERVICE],
            bonded: None,
        };

        let key = adv.identity_key(&[JADE_SERVICE]).unwrap();
        assert_eq!(
            key,
            IdentityKey::Ble {
                service: JADE_SERVICE,
                address: "AA:BB:CC:DD:EE:FF".to_string(),
            }
        );
        assert_eq!(key.ble_address(), Some("AA:BB:CC:DD:EE:FF"));
        assert!(adv.identity_key(&[]).is_none());
    }

    #[test]
    fn test_forward_transitions_require_predecessor() {
        use ConnectionState::*;

        assert!(Discovered.can_transition_to(Authorized));
        assert!(Authorized.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(Connecting));

        assert!(!Discovered.can_transition_to(Connecting));
        assert!(!Discovered.can_transition_to(Connected));
        assert!(!Authorized.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Discovered));
        assert!(!Offline.can_transition_to(Connected));
    }

    #[test]
    fn test_offline_always_reachable_from_live_states() {
        use ConnectionState::*;

        for state in [Discovered, Authorized, Connecting, Connected, Disconnected] {
            assert!(state.can_transition_to(Offline), "{state} -> offline");
        }
        assert!(!Offline.can_transition_to(Offline));
        assert!(Offline.can_transition_to(Discovered));
        assert!(Offline.can_transition_to(Authorized));
    }

    #[test]
    fn test_removed_is_terminal() {
        use ConnectionState::*;

        for state in [Discovered, Authorized, Connecting, Connected, Disconnected, Offline] {
            assert!(state.can_transition_to(Removed));
            assert!(!Removed.can_transition_to(state));
        }
    }

    #[test]
    fn test_timeout_class_budgets() {
        assert_eq!(
            TimeoutClass::Autonomous.default_budget(),
            Some(Duration::from_secs(4))
        );
        assert_eq!(
            TimeoutClass::AutonomousLong.default_budget(),
            Some(Duration::from_secs(8))
        );
        assert_eq!(
            TimeoutClass::UserInteraction.default_budget(),
            Some(Duration::from_secs(120))
        );
        assert_eq!(TimeoutClass::None.default_budget(), None);
        assert!(!TimeoutClass::UserInteraction.is_retry_safe());
    }

    #[test]
    fn test_usb_endpoint_rebuilt_from_device() {
        let ep = endpoint(Some("Jade"));
        let device = LogicalDevice::from_usb(&ep, 0);
        let rebuilt = device.usb_endpoint().unwrap();

        assert_eq!(rebuilt.identity_key(), ep.identity_key());
        assert_eq!(rebuilt.location(), ep.location());
        assert_eq!(device.state, ConnectionState::Discovered);
    }
}
