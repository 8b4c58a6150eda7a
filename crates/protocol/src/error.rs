//! Protocol and device error types

use crate::types::{ConnectionState, IdentityKey, TimeoutClass};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Session envelope errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialization error from postcard
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Incompatible envelope version detected
    #[error(
        "Incompatible envelope version: {major}.{minor} (expected {expected_major}.{expected_minor})"
    )]
    IncompatibleVersion {
        major: u8,
        minor: u8,
        expected_major: u8,
        expected_minor: u8,
    },

    /// Frame length exceeds maximum allowed size
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Incomplete frame data
    #[error("Incomplete frame: expected {expected} bytes, got {actual}")]
    IncompleteFrame { expected: usize, actual: usize },
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Why a permission request ended without a grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DenialReason {
    /// The OS refused access
    Refused,
    /// A newer request for the same endpoint replaced this one
    Superseded,
    /// The OS response could not be matched to a request
    Unmatched,
    /// The request was dropped (device removed, detached or manager shut down)
    Cancelled,
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            DenialReason::Refused => "refused",
            DenialReason::Superseded => "superseded",
            DenialReason::Unmatched => "unmatched response",
            DenialReason::Cancelled => "cancelled",
        };
        f.write_str(reason)
    }
}

/// Errors surfaced to callers of the device manager
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// OS refused access, or the request was superseded
    #[error("Permission denied ({reason})")]
    PermissionDenied { reason: DenialReason },

    /// Endpoint or advertisement outside the supported allow-list
    #[error("Device unsupported: {0}")]
    DeviceUnsupported(String),

    /// No response within the class budget; session state is unknown
    #[error("Timed out after {budget:?} waiting for a {class} response")]
    Timeout {
        class: TimeoutClass,
        budget: Duration,
    },

    /// Channel closed or disconnected mid-exchange
    #[error("Transport lost: {0}")]
    TransportLost(String),

    /// The request could not be framed for the device
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A request is already in flight on this session
    #[error("A request is already in flight on this session")]
    DuplicateRequest,

    /// The identity key is not in the registry
    #[error("Unknown device: {0}")]
    UnknownDevice(IdentityKey),

    /// A session is already open for this device
    #[error("Session already active for {0}")]
    SessionActive(IdentityKey),

    /// The device cannot be connected from its current state
    #[error("Device {key} is {state} and cannot be connected")]
    NotConnectable {
        key: IdentityKey,
        state: ConnectionState,
    },

    /// The requested state change is not legal
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
}

impl DeviceError {
    /// Whether blindly retrying the failed call is safe
    ///
    /// Only autonomous timeouts qualify; a user-interaction call may still be
    /// pending on the device.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeviceError::Timeout { class, .. } => class.is_retry_safe(),
            _ => false,
        }
    }
}
