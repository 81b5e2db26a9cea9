//! Typed views over device capability records
//!
//! A [`CapabilityDescriptor`] carries its payload as raw bytes. The decoders here
//! interpret the payload for the capability types whose layout is fixed by the
//! USB 3.2 specification; everything else stays opaque.

use crate::bos::CapabilityDescriptor;
use crate::error::{ProtocolError, Result};
use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use serde::Serialize;

/// `bDevCapabilityType` values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CapabilityType {
    WirelessUsb,
    Usb20Extension,
    SuperSpeedUsb,
    ContainerId,
    Platform,
    PowerDelivery,
    BatteryInfo,
    PdConsumerPort,
    PdProviderPort,
    SuperSpeedPlus,
    PrecisionTimeMeasurement,
    WirelessUsbExt,
    Billboard,
    Authentication,
    BillboardEx,
    ConfigurationSummary,
    Reserved(u8),
}

impl From<u8> for CapabilityType {
    fn from(value: u8) -> Self {
        match value {
            0x01 => CapabilityType::WirelessUsb,
            0x02 => CapabilityType::Usb20Extension,
            0x03 => CapabilityType::SuperSpeedUsb,
            0x04 => CapabilityType::ContainerId,
            0x05 => CapabilityType::Platform,
            0x06 => CapabilityType::PowerDelivery,
            0x07 => CapabilityType::BatteryInfo,
            0x08 => CapabilityType::PdConsumerPort,
            0x09 => CapabilityType::PdProviderPort,
            0x0A => CapabilityType::SuperSpeedPlus,
            0x0B => CapabilityType::PrecisionTimeMeasurement,
            0x0C => CapabilityType::WirelessUsbExt,
            0x0D => CapabilityType::Billboard,
            0x0E => CapabilityType::Authentication,
            0x0F => CapabilityType::BillboardEx,
            0x10 => CapabilityType::ConfigurationSummary,
            other => CapabilityType::Reserved(other),
        }
    }
}

impl CapabilityType {
    pub fn code(self) -> u8 {
        match self {
            CapabilityType::WirelessUsb => 0x01,
            CapabilityType::Usb20Extension => 0x02,
            CapabilityType::SuperSpeedUsb => 0x03,
            CapabilityType::ContainerId => 0x04,
            CapabilityType::Platform => 0x05,
            CapabilityType::PowerDelivery => 0x06,
            CapabilityType::BatteryInfo => 0x07,
            CapabilityType::PdConsumerPort => 0x08,
            CapabilityType::PdProviderPort => 0x09,
            CapabilityType::SuperSpeedPlus => 0x0A,
            CapabilityType::PrecisionTimeMeasurement => 0x0B,
            CapabilityType::WirelessUsbExt => 0x0C,
            CapabilityType::Billboard => 0x0D,
            CapabilityType::Authentication => 0x0E,
            CapabilityType::BillboardEx => 0x0F,
            CapabilityType::ConfigurationSummary => 0x10,
            CapabilityType::Reserved(code) => code,
        }
    }
}

/// USB 2.0 Extension capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Usb20Extension {
    pub attributes: u32,
}

impl Usb20Extension {
    /// Link Power Management support (bit 1)
    pub fn supports_lpm(&self) -> bool {
        self.attributes & 0x02 != 0
    }
}

/// SuperSpeed USB capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SuperSpeedUsb {
    pub attributes: u8,
    /// Bitmap of supported speeds (low, full, high, 5 Gbps)
    pub speeds_supported: u16,
    /// Lowest speed with full functionality
    pub functionality_support: u8,
    /// U1 exit latency in microseconds
    pub u1_exit_latency: u8,
    /// U2 exit latency in microseconds
    pub u2_exit_latency: u16,
}

/// Container ID capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContainerId {
    pub uuid: [u8; 16],
}

/// Platform capability
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformCapability {
    pub uuid: [u8; 16],
    pub data: Bytes,
}

/// A capability record interpreted by type
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DeviceCapability {
    Usb20Extension(Usb20Extension),
    SuperSpeedUsb(SuperSpeedUsb),
    ContainerId(ContainerId),
    Platform(PlatformCapability),
    Other {
        capability_type: CapabilityType,
        data: Bytes,
    },
}

impl DeviceCapability {
    /// Interpret a raw capability record
    ///
    /// Known types whose payload is shorter than their fixed layout fail
    /// with [`ProtocolError::Truncated`].
    pub fn decode(record: &CapabilityDescriptor) -> Result<Self> {
        let data = &record.data;
        let capability_type = CapabilityType::from(record.capability_type);

        match capability_type {
            CapabilityType::Usb20Extension => {
                require(data, 4)?;
                Ok(DeviceCapability::Usb20Extension(Usb20Extension {
                    attributes: LittleEndian::read_u32(&data[0..4]),
                }))
            }
            CapabilityType::SuperSpeedUsb => {
                require(data, 7)?;
                Ok(DeviceCapability::SuperSpeedUsb(SuperSpeedUsb {
                    attributes: data[0],
                    speeds_supported: LittleEndian::read_u16(&data[1..3]),
                    functionality_support: data[3],
                    u1_exit_latency: data[4],
                    u2_exit_latency: LittleEndian::read_u16(&data[5..7]),
                }))
            }
            CapabilityType::ContainerId => {
                require(data, 17)?;
                Ok(DeviceCapability::ContainerId(ContainerId {
                    uuid: uuid_at(data, 1),
                }))
            }
            CapabilityType::Platform => {
                require(data, 17)?;
                Ok(DeviceCapability::Platform(PlatformCapability {
                    uuid: uuid_at(data, 1),
                    data: data.slice(17..),
                }))
            }
            _ => Ok(DeviceCapability::Other {
                capability_type,
                data: data.clone(),
            }),
        }
    }
}

fn require(data: &[u8], needed: usize) -> Result<()> {
    if data.len() < needed {
        return Err(ProtocolError::Truncated {
            needed,
            available: data.len(),
        });
    }
    Ok(())
}

fn uuid_at(data: &[u8], offset: usize) -> [u8; 16] {
    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(&data[offset..offset + 16]);
    uuid
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(capability_type: u8, data: &[u8]) -> CapabilityDescriptor {
        CapabilityDescriptor {
            length: (data.len() + 3) as u8,
            descriptor_type: 0x10,
            capability_type,
            data: Bytes::copy_from_slice(data),
        }
    }

    #[test]
    fn test_capability_type_codes() {
        for code in 0u8..=0x12 {
            assert_eq!(CapabilityType::from(code).code(), code);
        }
        assert_eq!(CapabilityType::from(0x03), CapabilityType::SuperSpeedUsb);
        assert_eq!(CapabilityType::from(0x7F), CapabilityType::Reserved(0x7F));
    }

    #[test]
    fn test_usb20_extension_lpm() {
        let cap = DeviceCapability::decode(&record(0x02, &[0x06, 0x00, 0x00, 0x00])).unwrap();
        match cap {
            DeviceCapability::Usb20Extension(ext) => assert!(ext.supports_lpm()),
            other => panic!("unexpected capability: {:?}", other),
        }
    }

    #[test]
    fn test_superspeed_fields() {
        let cap = DeviceCapability::decode(&record(0x03, &[0x00, 0x0E, 0x00, 0x01, 0x0A, 0xFF, 0x07]))
            .unwrap();
        assert_eq!(
            cap,
            DeviceCapability::SuperSpeedUsb(SuperSpeedUsb {
                attributes: 0,
                speeds_supported: 0x000E,
                functionality_support: 1,
                u1_exit_latency: 0x0A,
                u2_exit_latency: 0x07FF,
            })
        );
    }

    #[test]
    fn test_platform_keeps_trailing_data() {
        let mut payload = vec![0u8];
        payload.extend(1..=16u8);
        payload.extend_from_slice(&[0xDE, 0xAD]);
        match DeviceCapability::decode(&record(0x05, &payload)).unwrap() {
            DeviceCapability::Platform(platform) => {
                assert_eq!(platform.uuid[0], 1);
                assert_eq!(platform.uuid[15], 16);
                assert_eq!(&platform.data[..], &[0xDE, 0xAD]);
            }
            other => panic!("unexpected capability: {:?}", other),
        }
    }

    #[test]
    fn test_truncated_container_id() {
        assert_eq!(
            DeviceCapability::decode(&record(0x04, &[0, 1, 2])),
            Err(ProtocolError::Truncated {
                needed: 17,
                available: 3
            })
        );
    }
}
