//! Codec error types

use thiserror::Error;

/// Errors raised while encoding control requests or decoding descriptors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Payload kind does not match the direction bit of `bmRequestType`
    #[error(
        "direction mismatch: bmRequestType {request_type:#04x} expects {expected} data"
    )]
    DirectionMismatch {
        request_type: u8,
        expected: &'static str,
    },

    /// OUT payload does not fit in the 16-bit `wLength` field
    #[error("control payload too large: {len} bytes (max: 65535)")]
    PayloadTooLarge { len: usize },

    /// Buffer ends before the structure it should contain
    #[error("truncated descriptor: needed {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    /// Descriptor carries an unexpected `bDescriptorType`
    #[error("invalid descriptor type: expected {expected:#04x}, got {actual:#04x}")]
    InvalidDescriptorType { expected: u8, actual: u8 },

    /// Capability record declares `bLength == 0`
    #[error("zero-length capability record at offset {offset}")]
    ZeroLengthRecord { offset: usize },

    /// Capability record is too short to hold its own header
    #[error("capability record at offset {offset} is too short ({length} bytes)")]
    RecordTooShort { offset: usize, length: usize },

    /// Capability record runs past `wTotalLength`
    #[error("capability record at offset {offset} ({length} bytes) overruns total length {total}")]
    RecordOverrun {
        offset: usize,
        length: usize,
        total: usize,
    },
}

impl ProtocolError {
    /// Whether the error comes from caller-supplied arguments rather than device data
    pub fn is_argument_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::DirectionMismatch { .. } | ProtocolError::PayloadTooLarge { .. }
        )
    }
}

/// Type alias for codec results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::RecordOverrun {
            offset: 5,
            length: 40,
            total: 22,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("offset 5"));
        assert!(msg.contains("22"));
    }

    #[test]
    fn test_argument_classification() {
        assert!(ProtocolError::PayloadTooLarge { len: 70_000 }.is_argument_error());
        assert!(
            ProtocolError::DirectionMismatch {
                request_type: 0x80,
                expected: "length",
            }
            .is_argument_error()
        );
        assert!(!ProtocolError::ZeroLengthRecord { offset: 5 }.is_argument_error());
    }
}
