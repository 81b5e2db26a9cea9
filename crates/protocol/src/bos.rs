//! Binary Object Store (BOS) descriptor decoding
//!
//! # Layout
//!
//! ```text
//! [bLength: u8][bDescriptorType: u8 = 0x0F][wTotalLength: u16][bNumDeviceCaps: u8]
//! [capability record]...
//!
//! capability record:
//! [bLength: u8][bDescriptorType: u8 = 0x10][bDevCapabilityType: u8][data: bLength - 3]
//! ```
//!
//! Records are walked by their own `bLength` starting right after the 5-byte
//! header, until the offset reaches `wTotalLength`. Capability payloads are
//! [`Bytes`] views into the buffer handed to [`decode_bos_descriptor`], so they
//! share its allocation instead of being copied.

use crate::error::{ProtocolError, Result};
use crate::types::{BOS_HEADER_SIZE, CAPABILITY_HEADER_SIZE, descriptor_type};
use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use serde::Serialize;

/// The fixed 5-byte BOS header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BosHeader {
    pub length: u8,
    pub descriptor_type: u8,
    /// Length of the header plus every capability record
    pub total_length: u16,
    /// Declared number of capability records
    pub num_device_caps: u8,
}

/// A decoded BOS descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BosDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub total_length: u16,
    pub num_device_caps: u8,
    /// Capability records in buffer order
    pub capabilities: Vec<CapabilityDescriptor>,
}

/// One raw device capability record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    /// `bDevCapabilityType`
    pub capability_type: u8,
    /// Record bytes after the 3-byte capability header
    pub data: Bytes,
}

impl BosDescriptor {
    /// Whether the number of parsed records matches `bNumDeviceCaps`
    pub fn count_matches(&self) -> bool {
        self.capabilities.len() == self.num_device_caps as usize
    }
}

/// Decode the BOS header from the first 5 bytes of `bytes`
///
/// Used after the first phase of a BOS fetch to learn `wTotalLength`.
pub fn decode_bos_header(bytes: &[u8]) -> Result<BosHeader> {
    if bytes.len() < BOS_HEADER_SIZE {
        return Err(ProtocolError::Truncated {
            needed: BOS_HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let header = BosHeader {
        length: bytes[0],
        descriptor_type: bytes[1],
        total_length: LittleEndian::read_u16(&bytes[2..4]),
        num_device_caps: bytes[4],
    };

    if header.descriptor_type != descriptor_type::BOS {
        return Err(ProtocolError::InvalidDescriptorType {
            expected: descriptor_type::BOS,
            actual: header.descriptor_type,
        });
    }

    Ok(header)
}

/// Decode a complete BOS descriptor
///
/// `wTotalLength` bounds the walk. Fails when a record has `bLength == 0`,
/// is shorter than its own header, or extends past `wTotalLength`, and when
/// the buffer holds fewer than `wTotalLength` bytes.
pub fn decode_bos_descriptor(buffer: Bytes) -> Result<BosDescriptor> {
    let header = decode_bos_header(&buffer)?;
    let total = header.total_length as usize;

    if total < BOS_HEADER_SIZE {
        return Err(ProtocolError::Truncated {
            needed: BOS_HEADER_SIZE,
            available: total,
        });
    }
    if buffer.len() < total {
        return Err(ProtocolError::Truncated {
            needed: total,
            available: buffer.len(),
        });
    }

    let mut capabilities = Vec::with_capacity(header.num_device_caps as usize);
    let mut offset = BOS_HEADER_SIZE;
    while offset < total {
        let length = buffer[offset] as usize;
        if length == 0 {
            return Err(ProtocolError::ZeroLengthRecord { offset });
        }
        if offset + length > total {
            return Err(ProtocolError::RecordOverrun {
                offset,
                length,
                total,
            });
        }
        if length < CAPABILITY_HEADER_SIZE {
            return Err(ProtocolError::RecordTooShort { offset, length });
        }

        capabilities.push(CapabilityDescriptor {
            length: buffer[offset],
            descriptor_type: buffer[offset + 1],
            capability_type: buffer[offset + 2],
            data: buffer.slice(offset + CAPABILITY_HEADER_SIZE..offset + length),
        });
        offset += length;
    }

    Ok(BosDescriptor {
        length: header.length,
        descriptor_type: header.descriptor_type,
        total_length: header.total_length,
        num_device_caps: header.num_device_caps,
        capabilities,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bos(records: &[&[u8]], declared: u8) -> Vec<u8> {
        let total: usize = BOS_HEADER_SIZE + records.iter().map(|r| r.len()).sum::<usize>();
        let mut out = vec![0x05, 0x0F, total as u8, (total >> 8) as u8, declared];
        for record in records {
            out.extend_from_slice(record);
        }
        out
    }

    #[test]
    fn test_decode_header_only() {
        let raw = bos(&[], 0);
        let desc = decode_bos_descriptor(Bytes::from(raw)).unwrap();
        assert_eq!(desc.total_length, 5);
        assert!(desc.capabilities.is_empty());
        assert!(desc.count_matches());
    }

    #[test]
    fn test_payload_is_view_into_buffer() {
        let raw = Bytes::from(bos(&[&[0x07, 0x10, 0x02, 0x06, 0x00, 0x00, 0x00]], 1));
        let desc = decode_bos_descriptor(raw.clone()).unwrap();
        let data = &desc.capabilities[0].data;
        assert_eq!(&data[..], &[0x06, 0x00, 0x00, 0x00]);
        // same allocation as the source buffer
        assert_eq!(data.as_ptr(), raw[8..].as_ptr());
    }

    #[test]
    fn test_zero_length_record() {
        let mut raw = bos(&[&[0x07, 0x10, 0x02, 0x06, 0x00, 0x00, 0x00]], 1);
        raw[5] = 0;
        assert_eq!(
            decode_bos_descriptor(Bytes::from(raw)),
            Err(ProtocolError::ZeroLengthRecord { offset: 5 })
        );
    }

    #[test]
    fn test_wrong_descriptor_type() {
        let mut raw = bos(&[], 0);
        raw[1] = 0x02;
        assert!(matches!(
            decode_bos_header(&raw),
            Err(ProtocolError::InvalidDescriptorType { expected: 0x0F, actual: 0x02 })
        ));
    }
}
