//! Control setup packet and string descriptor codec
//!
//! Every control transfer buffer starts with the 8-byte setup packet defined
//! by the USB specification. Multi-byte fields are little-endian:
//!
//! ```text
//! [bmRequestType: u8][bRequest: u8][wValue: u16][wIndex: u16][wLength: u16][payload...]
//! ```
//!
//! For IN requests the payload area is left zeroed and sized to `wLength` so the
//! device can fill it; for OUT requests it carries the bytes to send.

use crate::error::{ProtocolError, Result};
use crate::types::{CONTROL_SETUP_SIZE, Direction};
use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Decoded control setup packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ControlSetup {
    /// `bmRequestType`: direction, type and recipient bits
    pub request_type: u8,
    /// `bRequest`
    pub request: u8,
    /// `wValue`
    pub value: u16,
    /// `wIndex`
    pub index: u16,
    /// `wLength`: bytes in the data stage
    pub length: u16,
}

impl ControlSetup {
    /// Direction of the data stage, taken from the high bit of `bmRequestType`
    pub fn direction(&self) -> Direction {
        Direction::from_bits(self.request_type)
    }

    /// Encode into the 8-byte wire form
    ///
    /// # Example
    /// ```
    /// use protocol::ControlSetup;
    ///
    /// let setup = ControlSetup { request_type: 0x80, request: 0x06, value: 0x0304, index: 0x0409, length: 255 };
    /// assert_eq!(setup.encode(), [0x80, 0x06, 0x04, 0x03, 0x09, 0x04, 0xFF, 0x00]);
    /// ```
    pub fn encode(&self) -> [u8; CONTROL_SETUP_SIZE] {
        let mut out = [0u8; CONTROL_SETUP_SIZE];
        out[0] = self.request_type;
        out[1] = self.request;
        LittleEndian::write_u16(&mut out[2..4], self.value);
        LittleEndian::write_u16(&mut out[4..6], self.index);
        LittleEndian::write_u16(&mut out[6..8], self.length);
        out
    }

    /// Decode the setup packet at the start of `bytes`
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CONTROL_SETUP_SIZE {
            return Err(ProtocolError::Truncated {
                needed: CONTROL_SETUP_SIZE,
                available: bytes.len(),
            });
        }

        Ok(Self {
            request_type: bytes[0],
            request: bytes[1],
            value: LittleEndian::read_u16(&bytes[2..4]),
            index: LittleEndian::read_u16(&bytes[4..6]),
            length: LittleEndian::read_u16(&bytes[6..8]),
        })
    }
}

/// Data stage of a control request: a length to read or bytes to write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlData {
    /// Number of bytes to read (IN requests)
    In(u16),
    /// Bytes to send (OUT requests)
    Out(Bytes),
}

impl ControlData {
    pub fn direction(&self) -> Direction {
        match self {
            ControlData::In(_) => Direction::In,
            ControlData::Out(_) => Direction::Out,
        }
    }
}

impl From<u16> for ControlData {
    fn from(length: u16) -> Self {
        ControlData::In(length)
    }
}

impl From<Bytes> for ControlData {
    fn from(data: Bytes) -> Self {
        ControlData::Out(data)
    }
}

impl From<Vec<u8>> for ControlData {
    fn from(data: Vec<u8>) -> Self {
        ControlData::Out(Bytes::from(data))
    }
}

impl From<&'static [u8]> for ControlData {
    fn from(data: &'static [u8]) -> Self {
        ControlData::Out(Bytes::from_static(data))
    }
}

/// Build a complete control transfer buffer: setup packet plus data stage
///
/// Fails with [`ProtocolError::DirectionMismatch`] when the payload kind does not
/// match the direction bit of `request_type`, before any buffer is allocated.
///
/// # Example
/// ```
/// use protocol::{ControlData, encode_control_transfer};
///
/// let buf = encode_control_transfer(0x80, 0x06, 0x0100, 0, ControlData::In(18)).unwrap();
/// assert_eq!(buf.len(), 8 + 18);
/// assert!(encode_control_transfer(0x80, 0x06, 0x0100, 0, ControlData::Out(vec![1].into())).is_err());
/// ```
pub fn encode_control_transfer(
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    data: ControlData,
) -> Result<BytesMut> {
    let direction = Direction::from_bits(request_type);
    if direction != data.direction() {
        return Err(ProtocolError::DirectionMismatch {
            request_type,
            expected: match direction {
                Direction::In => "a length",
                Direction::Out => "a byte buffer",
            },
        });
    }

    let length = match &data {
        ControlData::In(length) => *length,
        ControlData::Out(payload) => u16::try_from(payload.len())
            .map_err(|_| ProtocolError::PayloadTooLarge { len: payload.len() })?,
    };

    let setup = ControlSetup {
        request_type,
        request,
        value,
        index,
        length,
    };

    let mut buf = BytesMut::with_capacity(CONTROL_SETUP_SIZE + length as usize);
    buf.put_slice(&setup.encode());
    match data {
        ControlData::In(_) => buf.put_bytes(0, length as usize),
        ControlData::Out(payload) => buf.put_slice(&payload),
    }

    Ok(buf)
}

/// Decode a string descriptor reply as UTF-16LE, skipping the 2-byte header
///
/// An empty reply means the device returned nothing and yields `None`.
/// Unpaired surrogates are replaced and a trailing odd byte is ignored.
pub fn decode_string_descriptor(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }

    let body = bytes.get(2..).unwrap_or_default();
    let units: Vec<u16> = body.chunks_exact(2).map(LittleEndian::read_u16).collect();
    Some(String::from_utf16_lossy(&units))
}
