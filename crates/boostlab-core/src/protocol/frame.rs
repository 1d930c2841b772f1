//! Frame encoding/decoding
//!
//! Implements the byte-level framing used on the ECU link:
//!
//! - 1 byte:  start marker (0xB5)
//! - 1 byte:  payload length
//! - N bytes: payload
//! - 1 byte:  checksum (low byte of CRC32 over length + payload)

use crc32fast::Hasher;
use std::fmt;

use super::ProtocolError;

/// Start-of-frame marker byte
pub const START_MARKER: u8 = 0xB5;

/// Maximum payload size (length field is a single byte)
pub const MAX_PAYLOAD_SIZE: usize = 255;

/// Total overhead bytes around a payload (start + length + checksum)
pub const FRAME_OVERHEAD: usize = 3;

/// Reasons a byte sequence failed frame validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFault {
    /// First byte is not the start marker
    BadStartMarker { actual: u8 },
    /// Fewer bytes available than the header promises
    Truncated { needed: usize, got: usize },
    /// Checksum byte does not match the computed value
    ChecksumMismatch { expected: u8, actual: u8 },
    /// Empty payload (every message carries at least a type marker)
    EmptyPayload,
}

impl fmt::Display for FrameFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameFault::BadStartMarker { actual } => {
                write!(f, "bad start marker {actual:#04x}")
            }
            FrameFault::Truncated { needed, got } => {
                write!(f, "truncated frame: needed {needed} bytes, got {got}")
            }
            FrameFault::ChecksumMismatch { expected, actual } => write!(
                f,
                "checksum mismatch: expected {expected:#04x}, got {actual:#04x}"
            ),
            FrameFault::EmptyPayload => write!(f, "empty payload"),
        }
    }
}

/// A raw protocol frame
///
/// Ephemeral: produced by the link transport, consumed immediately by the
/// codec. The payload is always checksum-verified before it exists as a
/// `Frame`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Verified payload bytes
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame from a payload
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }

    /// Encode the frame to raw wire bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.payload.len() + FRAME_OVERHEAD);
        bytes.push(START_MARKER);
        bytes.push(self.payload.len() as u8);
        bytes.extend_from_slice(&self.payload);
        bytes.push(checksum(&self.payload));
        bytes
    }

    /// Decode a frame from raw bytes.
    ///
    /// The slice must begin at the start marker. Returns the frame and the
    /// number of bytes consumed.
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize), ProtocolError> {
        if data.is_empty() {
            return Err(ProtocolError::FrameCorrupt(FrameFault::Truncated {
                needed: FRAME_OVERHEAD,
                got: 0,
            }));
        }
        if data[0] != START_MARKER {
            return Err(ProtocolError::FrameCorrupt(FrameFault::BadStartMarker {
                actual: data[0],
            }));
        }
        if data.len() < 2 {
            return Err(ProtocolError::FrameCorrupt(FrameFault::Truncated {
                needed: FRAME_OVERHEAD,
                got: data.len(),
            }));
        }

        let length = data[1] as usize;
        let total = length + FRAME_OVERHEAD;
        if data.len() < total {
            return Err(ProtocolError::FrameCorrupt(FrameFault::Truncated {
                needed: total,
                got: data.len(),
            }));
        }

        let payload = &data[2..2 + length];
        let expected = checksum(payload);
        let actual = data[2 + length];
        if expected != actual {
            return Err(ProtocolError::FrameCorrupt(FrameFault::ChecksumMismatch {
                expected,
                actual,
            }));
        }
        if length == 0 {
            return Err(ProtocolError::FrameCorrupt(FrameFault::EmptyPayload));
        }

        Ok((Self::new(payload.to_vec()), total))
    }

    /// Total encoded size on the wire
    pub fn encoded_size(&self) -> usize {
        self.payload.len() + FRAME_OVERHEAD
    }
}

/// Frame checksum: low byte of the CRC32 over length byte + payload
pub fn checksum(payload: &[u8]) -> u8 {
    let mut hasher = Hasher::new();
    hasher.update(&[payload.len() as u8]);
    hasher.update(payload);
    (hasher.finalize() & 0xFF) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let original = Frame::new(vec![0x01, 0x0C]);
        let encoded = original.to_bytes();
        let (decoded, consumed) = Frame::from_bytes(&encoded).expect("should decode");

        assert_eq!(original, decoded);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_corrupted_checksum_rejected() {
        let frame = Frame::new(vec![1, 2, 3, 4]);
        let mut encoded = frame.to_bytes();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;

        match Frame::from_bytes(&encoded) {
            Err(ProtocolError::FrameCorrupt(FrameFault::ChecksumMismatch { .. })) => {}
            other => panic!("expected checksum mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_corrupted_payload_rejected() {
        let frame = Frame::new(vec![1, 2, 3, 4]);
        let mut encoded = frame.to_bytes();
        encoded[3] ^= 0x40;

        assert!(Frame::from_bytes(&encoded).is_err());
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let frame = Frame::new(vec![1, 2, 3, 4]);
        let encoded = frame.to_bytes();

        match Frame::from_bytes(&encoded[..encoded.len() - 2]) {
            Err(ProtocolError::FrameCorrupt(FrameFault::Truncated { .. })) => {}
            other => panic!("expected truncation fault, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_start_marker_rejected() {
        let mut encoded = Frame::new(vec![0x07]).to_bytes();
        encoded[0] = 0x00;

        match Frame::from_bytes(&encoded) {
            Err(ProtocolError::FrameCorrupt(FrameFault::BadStartMarker { actual: 0 })) => {}
            other => panic!("expected bad start marker, got {other:?}"),
        }
    }
}
