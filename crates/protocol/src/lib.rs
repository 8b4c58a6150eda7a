//! Protocol library for hw-devmgr
//!
//! This crate defines the data model shared by the device manager and its
//! backends: identity keys, raw transport endpoints, logical devices and their
//! connection states, timeout classes, the caller-facing error kinds, and the
//! envelope codec used for request/response exchanges with a signing device.
//!
//! # Example
//!
//! ```
//! use protocol::{Envelope, RequestId, FrameDecoder, encode_framed};
//!
//! let framed = encode_framed(&Envelope::new(RequestId(1), b"get_version".to_vec())).unwrap();
//!
//! let mut decoder = FrameDecoder::new();
//! decoder.push(&framed);
//! let envelope = decoder.next_envelope().unwrap().unwrap();
//! assert_eq!(envelope.payload, b"get_version");
//! ```

pub mod codec;
pub mod error;
pub mod messages;
pub mod types;

pub use codec::{
    FrameDecoder, MAX_FRAME_SIZE, decode_framed, decode_message, encode_framed, encode_message,
    validate_version,
};
pub use error::{DenialReason, DeviceError, ProtocolError, Result};
pub use messages::{CURRENT_VERSION, Envelope, EnvelopeVersion};
pub use types::{
    BleAdvertisement, ConnectionState, CorrelationToken, IdentityKey, LogicalDevice, RequestId,
    TIMEOUT_AUTONOMOUS, TIMEOUT_AUTONOMOUS_LONG, TIMEOUT_USER_INTERACTION, TimeoutClass,
    TransportDetails, TransportKind, USB_CLASS_HUB, UsbEndpoint, normalize_ble_address,
};
