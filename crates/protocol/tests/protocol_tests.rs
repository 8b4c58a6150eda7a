//! Integration tests for the device data model and session envelopes
//!
//! Walks the connection lifecycle the way the device manager drives it and
//! exercises the envelope codec over a simulated byte stream.

use protocol::{
    BleAdvertisement, ConnectionState, DenialReason, DeviceError, Envelope, FrameDecoder,
    IdentityKey, LogicalDevice, ProtocolError, RequestId, TimeoutClass, TransportKind,
    UsbEndpoint, encode_framed,
};
use std::time::Duration;
use uuid::Uuid;

const JADE_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

fn ledger_endpoint(address: u8) -> UsbEndpoint {
    UsbEndpoint {
        bus_number: 2,
        device_address: address,
        vendor_id: 0x2c97,
        product_id: 0x4011,
        class: 0,
        serial_number: Some("0001".to_string()),
        manufacturer: Some("Ledger".to_string()),
        product: Some("Nano X".to_string()),
    }
}

// ============================================================================
// Connection lifecycle
// ============================================================================

mod lifecycle {
    use super::*;

    fn walk(path: &[ConnectionState]) -> bool {
        path.windows(2).all(|pair| pair[0].can_transition_to(pair[1]))
    }

    #[test]
    fn test_usb_lifecycle_path() {
        use ConnectionState::*;

        assert!(walk(&[
            Discovered,
            Authorized,
            Connecting,
            Connected,
            Offline,
            Discovered,
            Authorized,
            Connecting,
            Connected,
            Disconnected,
            Connecting,
            Connected,
            Removed,
        ]));
    }

    #[test]
    fn test_ble_lifecycle_path() {
        use ConnectionState::*;

        assert!(walk(&[
            Authorized,
            Offline,
            Authorized,
            Connecting,
            Authorized,
            Connecting,
            Connected,
            Disconnected,
        ]));
    }

    #[test]
    fn test_connectable_states() {
        use ConnectionState::*;

        let connectable: Vec<_> = [
            Discovered,
            Authorized,
            Connecting,
            Connected,
            Disconnected,
            Offline,
            Removed,
        ]
        .into_iter()
        .filter(|state| state.is_connectable())
        .collect();

        assert_eq!(connectable, vec![Authorized, Disconnected]);
        assert!(Connecting.is_live());
        assert!(Connected.is_live());
        assert!(!Disconnected.is_live());
    }

    #[test]
    fn test_devices_start_in_transport_state() {
        let usb = LogicalDevice::from_usb(&ledger_endpoint(5), 0);
        assert_eq!(usb.state, ConnectionState::Discovered);
        assert_eq!(usb.transport(), TransportKind::Usb);
        assert_eq!(usb.label, "Nano X");

        let advertisement = BleAdvertisement {
            address: "c0:ff:ee:00:00:01".to_string(),
            name: None,
            service_uuids: vec![JADE_SERVICE],
            bonded: Some(false),
        };
        let key = advertisement.identity_key(&[JADE_SERVICE]).unwrap();
        let ble = LogicalDevice::from_ble(key, &advertisement, 1);

        assert_eq!(ble.state, ConnectionState::Authorized);
        assert_eq!(ble.transport(), TransportKind::Ble);
        assert_eq!(ble.label, "BLE device C0:FF:EE:00:00:01");
        assert_eq!(ble.bonded, Some(false));
    }

    #[test]
    fn test_identity_survives_reattachment() {
        let first = LogicalDevice::from_usb(&ledger_endpoint(5), 0);
        let second = LogicalDevice::from_usb(&ledger_endpoint(11), 1);

        assert_eq!(first.key, second.key);
        assert_ne!(
            first.usb_endpoint().unwrap().location(),
            second.usb_endpoint().unwrap().location()
        );
    }

    #[test]
    fn test_keys_distinguish_serials() {
        let mut other = ledger_endpoint(5);
        other.serial_number = Some("0002".to_string());
        let mut unreadable = ledger_endpoint(5);
        unreadable.serial_number = None;

        assert_ne!(ledger_endpoint(5).identity_key(), other.identity_key());
        assert_ne!(ledger_endpoint(5).identity_key(), unreadable.identity_key());
        assert_eq!(unreadable.identity_key().to_string(), "usb:2c97:4011");
    }
}

// ============================================================================
// Errors
// ============================================================================

mod errors {
    use super::*;

    #[test]
    fn test_device_error_messages() {
        let key = ledger_endpoint(5).identity_key();

        let timeout = DeviceError::Timeout {
            class: TimeoutClass::UserInteraction,
            budget: Duration::from_secs(120),
        };
        assert!(timeout.to_string().contains("user-interaction"));

        let not_connectable = DeviceError::NotConnectable {
            key: key.clone(),
            state: ConnectionState::Offline,
        };
        assert!(not_connectable.to_string().contains("offline"));
        assert!(not_connectable.to_string().contains("usb:2c97:4011:0001"));

        let denied = DeviceError::PermissionDenied {
            reason: DenialReason::Unmatched,
        };
        assert!(denied.to_string().contains("unmatched"));
    }

    #[test]
    fn test_errors_are_cloneable_for_continuations() {
        let error = DeviceError::UnknownDevice(IdentityKey::Ble {
            service: JADE_SERVICE,
            address: "AA".to_string(),
        });
        assert_eq!(error.clone(), error);
    }
}

// ============================================================================
// Envelope stream
// ============================================================================

mod envelope_stream {
    use super::*;

    #[test]
    fn test_stale_and_current_replies_in_one_read() {
        let stale = encode_framed(&Envelope::new(RequestId(1), b"late".to_vec())).unwrap();
        let current = encode_framed(&Envelope::new(RequestId(2), b"ok".to_vec())).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.push(&[stale, current].concat());

        let ids: Vec<_> = std::iter::from_fn(|| decoder.next_envelope().unwrap())
            .map(|envelope| envelope.id)
            .collect();
        assert_eq!(ids, vec![RequestId(1), RequestId(2)]);
    }

    #[test]
    fn test_oversized_length_prefix_poisons_stream() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&u32::MAX.to_be_bytes());

        assert!(matches!(
            decoder.next_envelope(),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_garbage_body_rejected() {
        let mut frame = 3u32.to_be_bytes().to_vec();
        frame.extend_from_slice(&[0xff, 0xff, 0xff]);

        let mut decoder = FrameDecoder::new();
        decoder.push(&frame);
        assert!(decoder.next_envelope().is_err());
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let framed = encode_framed(&Envelope::new(RequestId(7), Vec::new())).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.push(&framed);

        let envelope = decoder.next_envelope().unwrap().unwrap();
        assert!(envelope.payload.is_empty());
        assert_eq!(decoder.buffered(), 0);
    }
}
