//! Wire formats for the USB host library
//!
//! This crate holds everything that is pure byte manipulation: the 8-byte
//! control setup packet, string descriptor decoding, the Binary Object Store
//! (BOS) descriptor walk and typed device capability views, plus the parsed
//! descriptor model shared by the rest of the workspace. Nothing here talks
//! to a device.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use protocol::{decode_bos_descriptor, CapabilityType};
//!
//! // BOS header (wTotalLength = 12, one capability) + USB 2.0 Extension record
//! let raw = Bytes::from_static(&[
//!     0x05, 0x0F, 0x0C, 0x00, 0x01,
//!     0x07, 0x10, 0x02, 0x06, 0x00, 0x00, 0x00,
//! ]);
//! let bos = decode_bos_descriptor(raw).unwrap();
//! assert_eq!(bos.capabilities.len(), 1);
//! assert_eq!(
//!     CapabilityType::from(bos.capabilities[0].capability_type),
//!     CapabilityType::Usb20Extension
//! );
//! ```

pub mod bos;
pub mod capability;
pub mod codec;
pub mod error;
pub mod types;

pub use bos::{
    BosDescriptor, BosHeader, CapabilityDescriptor, decode_bos_descriptor, decode_bos_header,
};
pub use capability::{
    CapabilityType, ContainerId, DeviceCapability, PlatformCapability, SuperSpeedUsb,
    Usb20Extension,
};
pub use codec::{ControlData, ControlSetup, decode_string_descriptor, encode_control_transfer};
pub use error::{ProtocolError, Result};
pub use types::{
    BOS_HEADER_SIZE, BOS_MIN_USB_VERSION, CAPABILITY_HEADER_SIZE, CONTROL_SETUP_SIZE,
    ConfigDescriptor, DeviceDescriptor, Direction, ENDPOINT_DIR_MASK, ENDPOINT_IN, ENDPOINT_OUT,
    EndpointDescriptor, InterfaceDescriptor, LANGUAGE_ID_EN_US, MAX_STRING_DESCRIPTOR_LENGTH,
    TRANSFER_TYPE_MASK, TransferKind, descriptor_type, request, request_type,
};
