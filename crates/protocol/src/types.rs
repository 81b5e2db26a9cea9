//! USB descriptor model and standard constants
//!
//! This module defines the parsed forms of the standard device, configuration,
//! interface and endpoint descriptors, along with the request codes and
//! descriptor type values used when talking to the default control pipe.

use serde::{Deserialize, Serialize};

/// Size of the setup packet that precedes every control transfer buffer
pub const CONTROL_SETUP_SIZE: usize = 8;

/// Size of the fixed BOS descriptor header
pub const BOS_HEADER_SIZE: usize = 5;

/// Size of the header shared by every device capability record
pub const CAPABILITY_HEADER_SIZE: usize = 3;

/// Direction bit of an endpoint address or `bmRequestType`
pub const ENDPOINT_DIR_MASK: u8 = 0x80;

/// In: device-to-host
pub const ENDPOINT_IN: u8 = 0x80;

/// Out: host-to-device
pub const ENDPOINT_OUT: u8 = 0x00;

/// Transfer type bits of an endpoint's `bmAttributes`
pub const TRANSFER_TYPE_MASK: u8 = 0x03;

/// US English, the language used for string descriptor requests
pub const LANGUAGE_ID_EN_US: u16 = 0x0409;

/// Largest string descriptor requested from a device
pub const MAX_STRING_DESCRIPTOR_LENGTH: u16 = 255;

/// First USB release (bcdUSB) that defines the BOS descriptor
pub const BOS_MIN_USB_VERSION: u16 = 0x0201;

/// Standard request codes (`bRequest`)
pub mod request {
    pub const GET_STATUS: u8 = 0x00;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_FEATURE: u8 = 0x03;
    pub const SET_ADDRESS: u8 = 0x05;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_DESCRIPTOR: u8 = 0x07;
    pub const GET_CONFIGURATION: u8 = 0x08;
    pub const SET_CONFIGURATION: u8 = 0x09;
    pub const GET_INTERFACE: u8 = 0x0A;
    pub const SET_INTERFACE: u8 = 0x0B;
    pub const SYNCH_FRAME: u8 = 0x0C;
}

/// Descriptor type codes (`bDescriptorType`)
pub mod descriptor_type {
    pub const DEVICE: u8 = 0x01;
    pub const CONFIG: u8 = 0x02;
    pub const STRING: u8 = 0x03;
    pub const INTERFACE: u8 = 0x04;
    pub const ENDPOINT: u8 = 0x05;
    pub const BOS: u8 = 0x0F;
    pub const DEVICE_CAPABILITY: u8 = 0x10;
    pub const HID: u8 = 0x21;
    pub const REPORT: u8 = 0x22;
    pub const PHYSICAL: u8 = 0x23;
    pub const HUB: u8 = 0x29;
}

/// Type and recipient bits of `bmRequestType`
pub mod request_type {
    pub const STANDARD: u8 = 0x00 << 5;
    pub const CLASS: u8 = 0x01 << 5;
    pub const VENDOR: u8 = 0x02 << 5;
    pub const RESERVED: u8 = 0x03 << 5;

    pub const RECIPIENT_DEVICE: u8 = 0x00;
    pub const RECIPIENT_INTERFACE: u8 = 0x01;
    pub const RECIPIENT_ENDPOINT: u8 = 0x02;
    pub const RECIPIENT_OTHER: u8 = 0x03;
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl Direction {
    /// Direction encoded in the high bit of an endpoint address or `bmRequestType`
    pub fn from_bits(value: u8) -> Self {
        if value & ENDPOINT_DIR_MASK != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// Endpoint transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferKind {
    /// Transfer type from the low two bits of an endpoint's `bmAttributes`
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & TRANSFER_TYPE_MASK {
            0 => TransferKind::Control,
            1 => TransferKind::Isochronous,
            2 => TransferKind::Bulk,
            _ => TransferKind::Interrupt,
        }
    }

    /// libusb transfer type code
    pub fn code(self) -> u8 {
        match self {
            TransferKind::Control => 0,
            TransferKind::Isochronous => 1,
            TransferKind::Bulk => 2,
            TransferKind::Interrupt => 3,
        }
    }
}

/// Standard device descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// USB specification release in BCD (`bcdUSB`)
    pub usb_version: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    /// Maximum packet size of endpoint 0
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Device release in BCD (`bcdDevice`)
    pub device_version: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    pub num_configurations: u8,
}

/// Configuration descriptor with its interfaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDescriptor {
    /// Value passed to SET_CONFIGURATION (`bConfigurationValue`)
    pub configuration_value: u8,
    pub configuration_index: u8,
    pub attributes: u8,
    /// Maximum power draw in milliamps
    pub max_power_ma: u16,
    /// One entry per interface, each holding every alternate setting
    pub interfaces: Vec<Vec<InterfaceDescriptor>>,
}

impl ConfigDescriptor {
    /// Number of interfaces in this configuration
    pub fn num_interfaces(&self) -> usize {
        self.interfaces.len()
    }
}

/// Interface descriptor for one alternate setting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub interface_index: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// Endpoint descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// Endpoint address, direction in the high bit (`bEndpointAddress`)
    pub address: u8,
    /// Transfer type, sync and usage bits (`bmAttributes`)
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn direction(&self) -> Direction {
        Direction::from_bits(self.address)
    }

    pub fn transfer_kind(&self) -> TransferKind {
        TransferKind::from_attributes(self.attributes)
    }

    /// Endpoint number without the direction bit
    pub fn number(&self) -> u8 {
        self.address & 0x0F
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_from_bits() {
        assert_eq!(Direction::from_bits(0x81), Direction::In);
        assert_eq!(Direction::from_bits(0x80), Direction::In);
        assert_eq!(Direction::from_bits(0x02), Direction::Out);
        assert_eq!(Direction::from_bits(0x40), Direction::Out);
    }

    #[test]
    fn test_transfer_kind_from_attributes() {
        assert_eq!(TransferKind::from_attributes(0x00), TransferKind::Control);
        assert_eq!(TransferKind::from_attributes(0x05), TransferKind::Isochronous);
        assert_eq!(TransferKind::from_attributes(0x02), TransferKind::Bulk);
        assert_eq!(TransferKind::from_attributes(0x03), TransferKind::Interrupt);
    }

    #[test]
    fn test_endpoint_descriptor_accessors() {
        let ep = EndpointDescriptor {
            address: 0x83,
            attributes: 0x03,
            max_packet_size: 8,
            interval: 10,
        };
        assert_eq!(ep.direction(), Direction::In);
        assert_eq!(ep.transfer_kind(), TransferKind::Interrupt);
        assert_eq!(ep.number(), 3);
    }
}
