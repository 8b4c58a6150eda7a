//! Envelope serialization and framing using postcard
//!
//! Envelopes are serialized with postcard and framed with a length prefix so
//! they can travel over byte-oriented device channels (USB bulk endpoints, BLE
//! characteristics) that deliver data in arbitrary chunks.
//!
//! # Frame Format
//!
//! ```text
//! [Length: u32 (big-endian)][Envelope bytes (postcard serialized)]
//! ```

use crate::error::{ProtocolError, Result};
use crate::messages::{CURRENT_VERSION, Envelope, EnvelopeVersion};
use bytes::{Buf, BytesMut};

/// Maximum allowed frame size (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

/// Encode an envelope to bytes using postcard
///
/// # Example
/// ```
/// use protocol::{Envelope, RequestId, encode_message, decode_message};
///
/// let envelope = Envelope::new(RequestId(1), vec![0xde, 0xad]);
/// let bytes = encode_message(&envelope).unwrap();
/// assert_eq!(decode_message(&bytes).unwrap(), envelope);
/// ```
pub fn encode_message(envelope: &Envelope) -> Result<Vec<u8>> {
    postcard::to_allocvec(envelope).map_err(ProtocolError::from)
}

/// Decode an envelope from bytes using postcard
pub fn decode_message(bytes: &[u8]) -> Result<Envelope> {
    postcard::from_bytes(bytes).map_err(ProtocolError::from)
}

/// Validate envelope version compatibility
pub fn validate_version(version: &EnvelopeVersion) -> Result<()> {
    if !CURRENT_VERSION.is_compatible_with(version) {
        return Err(ProtocolError::IncompatibleVersion {
            major: version.major,
            minor: version.minor,
            expected_major: CURRENT_VERSION.major,
            expected_minor: CURRENT_VERSION.minor,
        });
    }
    Ok(())
}

/// Encode an envelope with length prefix for framing
///
/// # Example
/// ```
/// use protocol::{Envelope, RequestId, encode_framed, decode_framed};
///
/// let envelope = Envelope::new(RequestId(7), b"ping".to_vec());
/// let framed = encode_framed(&envelope).unwrap();
/// assert_eq!(decode_framed(&framed).unwrap().id, RequestId(7));
/// ```
pub fn encode_framed(envelope: &Envelope) -> Result<Vec<u8>> {
    let message_bytes = encode_message(envelope)?;
    let message_len = message_bytes.len();

    if message_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: message_len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX + message_len);
    frame.extend_from_slice(&(message_len as u32).to_be_bytes());
    frame.extend_from_slice(&message_bytes);

    Ok(frame)
}

/// Decode a single complete frame
pub fn decode_framed(frame: &[u8]) -> Result<Envelope> {
    let length = read_length(frame)?;

    if frame.len() < LENGTH_PREFIX + length {
        return Err(ProtocolError::IncompleteFrame {
            expected: LENGTH_PREFIX + length,
            actual: frame.len(),
        });
    }

    let envelope = decode_message(&frame[LENGTH_PREFIX..LENGTH_PREFIX + length])?;
    validate_version(&envelope.version)?;
    Ok(envelope)
}

fn read_length(frame: &[u8]) -> Result<usize> {
    let Some(prefix) = frame.get(..LENGTH_PREFIX) else {
        return Err(ProtocolError::IncompleteFrame {
            expected: LENGTH_PREFIX,
            actual: frame.len(),
        });
    };

    let length = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(length)
}

/// Incremental frame decoder for chunked channels
///
/// Bytes are pushed as they arrive; complete envelopes are popped in order.
/// A partial frame stays buffered across reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Pop the next complete envelope, if one is buffered
    pub fn next_envelope(&mut self) -> Result<Option<Envelope>> {
        if self.buffer.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let length = read_length(&self.buffer)?;
        if self.buffer.len() < LENGTH_PREFIX + length {
            return Ok(None);
        }

        self.buffer.advance(LENGTH_PREFIX);
        let body = self.buffer.split_to(length);
        let envelope = decode_message(&body)?;
        validate_version(&envelope.version)?;
        Ok(Some(envelope))
    }

    /// Number of buffered bytes not yet decoded
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any buffered bytes
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RequestId;

    #[test]
    fn test_framed_roundtrip() {
        let envelope = Envelope::new(RequestId(3), vec![1, 2, 3, 4]);
        let framed = encode_framed(&envelope).unwrap();

        assert_eq!(&framed[..4], &((framed.len() - 4) as u32).to_be_bytes());
        assert_eq!(decode_framed(&framed).unwrap(), envelope);
    }

    #[test]
    fn test_decode_framed_incomplete() {
        let framed = encode_framed(&Envelope::new(RequestId(1), vec![9; 16])).unwrap();

        assert!(matches!(
            decode_framed(&framed[..2]),
            Err(ProtocolError::IncompleteFrame { expected: 4, .. })
        ));
        assert!(matches!(
            decode_framed(&framed[..framed.len() - 1]),
            Err(ProtocolError::IncompleteFrame { .. })
        ));
    }

    #[test]
    fn test_frame_too_large_rejected() {
        let mut frame = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&[0; 8]);

        assert!(matches!(
            decode_framed(&frame),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_decoder_reassembles_chunks() {
        let first = encode_framed(&Envelope::new(RequestId(1), b"first".to_vec())).unwrap();
        let second = encode_framed(&Envelope::new(RequestId(2), b"second".to_vec())).unwrap();
        let stream: Vec<u8> = first.iter().chain(second.iter()).copied().collect();

        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();
        for chunk in stream.chunks(3) {
            decoder.push(chunk);
            while let Some(envelope) = decoder.next_envelope().unwrap() {
                decoded.push(envelope);
            }
        }

        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].payload, b"first");
        assert_eq!(decoded[1].id, RequestId(2));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_keeps_partial_frame() {
        let framed = encode_framed(&Envelope::new(RequestId(5), vec![7; 32])).unwrap();
        let mut decoder = FrameDecoder::new();

        decoder.push(&framed[..10]);
        assert!(decoder.next_envelope().unwrap().is_none());
        assert_eq!(decoder.buffered(), 10);

        decoder.push(&framed[10..]);
        assert_eq!(decoder.next_envelope().unwrap().unwrap().id, RequestId(5));
    }

    #[test]
    fn test_incompatible_version_rejected() {
        let mut envelope = Envelope::new(RequestId(1), vec![]);
        envelope.version = EnvelopeVersion { major: 9, minor: 0 };
        let framed = encode_framed(&envelope).unwrap();

        assert!(matches!(
            decode_framed(&framed),
            Err(ProtocolError::IncompatibleVersion { major: 9, .. })
        ));
    }
}
