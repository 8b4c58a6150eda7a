//! Session envelope definitions
//!
//! Request and response payloads exchanged with a signing device are opaque to
//! the device manager. Each payload travels inside an [`Envelope`] that carries
//! the envelope version and the [`RequestId`] it belongs to, so a late answer to
//! an abandoned request can be told apart from the answer to the current one.

use crate::types::RequestId;
use serde::{Deserialize, Serialize};

/// Envelope format version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeVersion {
    pub major: u8,
    pub minor: u8,
}

/// Envelope version produced by this crate
pub const CURRENT_VERSION: EnvelopeVersion = EnvelopeVersion { major: 1, minor: 0 };

impl EnvelopeVersion {
    /// Envelopes are readable when the major version matches
    pub fn is_compatible_with(&self, other: &EnvelopeVersion) -> bool {
        self.major == other.major
    }
}

/// A request or response payload tagged with its request id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Envelope version of this message
    pub version: EnvelopeVersion,
    /// Request this payload belongs to
    pub id: RequestId,
    /// Opaque device payload
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(id: RequestId, payload: Vec<u8>) -> Self {
        Self {
            version: CURRENT_VERSION,
            id,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_envelope_uses_current_version() {
        let envelope = Envelope::new(RequestId(9), vec![1, 2, 3]);
        assert_eq!(envelope.version, CURRENT_VERSION);
        assert_eq!(envelope.id, RequestId(9));
    }

    #[test]
    fn test_minor_versions_are_compatible() {
        let newer = EnvelopeVersion { major: 1, minor: 3 };
        let next_major = EnvelopeVersion { major: 2, minor: 0 };

        assert!(CURRENT_VERSION.is_compatible_with(&newer));
        assert!(!CURRENT_VERSION.is_compatible_with(&next_major));
    }
}
