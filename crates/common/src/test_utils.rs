//! Test utilities for the USB host workspace
//!
//! Provides descriptor fixtures and a timeout wrapper for async tests.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{create_mock_device_descriptor, create_mock_string_descriptor};
//!
//! let desc = create_mock_device_descriptor(0x1234, 0x5678, 0x0210);
//! assert_eq!(desc.vendor_id, 0x1234);
//! assert_eq!(create_mock_string_descriptor("A"), vec![0x04, 0x03, b'A', 0x00]);
//! ```

use protocol::{ConfigDescriptor, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor};
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a device descriptor with string indices 1 (manufacturer),
/// 2 (product) and 3 (serial number)
///
/// # Arguments
/// * `vendor_id` - USB Vendor ID
/// * `product_id` - USB Product ID
/// * `usb_version` - bcdUSB, e.g. `0x0200` or `0x0210`
pub fn create_mock_device_descriptor(
    vendor_id: u16,
    product_id: u16,
    usb_version: u16,
) -> DeviceDescriptor {
    DeviceDescriptor {
        usb_version,
        device_class: 0x00,
        device_subclass: 0x00,
        device_protocol: 0x00,
        max_packet_size0: 64,
        vendor_id,
        product_id,
        device_version: 0x0100,
        manufacturer_index: 1,
        product_index: 2,
        serial_number_index: 3,
        num_configurations: 1,
    }
}

/// Create an endpoint descriptor
pub fn create_mock_endpoint(address: u8, attributes: u8, max_packet_size: u16) -> EndpointDescriptor {
    EndpointDescriptor {
        address,
        attributes,
        max_packet_size,
        interval: if attributes & 0x03 == 0x03 { 10 } else { 0 },
    }
}

/// Create a vendor-specific interface descriptor
pub fn create_mock_interface(
    interface_number: u8,
    alternate_setting: u8,
    endpoints: Vec<EndpointDescriptor>,
) -> InterfaceDescriptor {
    InterfaceDescriptor {
        interface_number,
        alternate_setting,
        interface_class: 0xFF,
        interface_subclass: 0x00,
        interface_protocol: 0x00,
        interface_index: 0,
        endpoints,
    }
}

/// Create a configuration descriptor
///
/// Interface 0 has bulk endpoints 0x81/0x02 (512 bytes) in alternate setting 0
/// and an interrupt IN endpoint 0x83 (8 bytes) in alternate setting 1.
/// Interface 1 has a single bulk IN endpoint 0x84.
pub fn create_mock_config_descriptor(configuration_value: u8) -> ConfigDescriptor {
    ConfigDescriptor {
        configuration_value,
        configuration_index: configuration_value.saturating_sub(1),
        attributes: 0x80,
        max_power_ma: 100,
        interfaces: vec![
            vec![
                create_mock_interface(
                    0,
                    0,
                    vec![
                        create_mock_endpoint(0x81, 0x02, 512),
                        create_mock_endpoint(0x02, 0x02, 512),
                    ],
                ),
                create_mock_interface(0, 1, vec![create_mock_endpoint(0x83, 0x03, 8)]),
            ],
            vec![create_mock_interface(1, 0, vec![create_mock_endpoint(0x84, 0x02, 64)])],
        ],
    }
}

/// Create a configuration descriptor with a single interface and no endpoints
pub fn create_mock_minimal_config(configuration_value: u8) -> ConfigDescriptor {
    ConfigDescriptor {
        configuration_value,
        configuration_index: configuration_value.saturating_sub(1),
        attributes: 0x80,
        max_power_ma: 50,
        interfaces: vec![vec![create_mock_interface(0, 0, Vec::new())]],
    }
}

/// Encode a string descriptor (2-byte header followed by UTF-16LE)
pub fn create_mock_string_descriptor(value: &str) -> Vec<u8> {
    let mut out = vec![0x00, 0x03];
    for unit in value.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out[0] = out.len() as u8;
    out
}

/// Encode a BOS descriptor from raw capability records
///
/// `wTotalLength` is computed from the records and `bNumDeviceCaps` is set
/// to their count.
pub fn create_mock_bos(records: &[Vec<u8>]) -> Vec<u8> {
    let total = 5 + records.iter().map(|r| r.len()).sum::<usize>();
    let mut out = vec![
        0x05,
        0x0F,
        (total & 0xFF) as u8,
        ((total >> 8) & 0xFF) as u8,
        records.len() as u8,
    ];
    for record in records {
        out.extend_from_slice(record);
    }
    out
}

/// USB 2.0 Extension capability record with LPM supported
pub fn create_mock_usb2_extension() -> Vec<u8> {
    vec![0x07, 0x10, 0x02, 0x06, 0x00, 0x00, 0x00]
}

/// SuperSpeed USB capability record
pub fn create_mock_superspeed() -> Vec<u8> {
    vec![0x0A, 0x10, 0x03, 0x00, 0x0E, 0x00, 0x01, 0x0A, 0xFF, 0x07]
}

/// Create mock bulk transfer data of specified size
pub fn create_mock_bulk_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i & 0xFF) as u8).collect()
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use protocol::{decode_bos_descriptor, decode_string_descriptor};

    #[test]
    fn test_mock_config_layout() {
        let config = create_mock_config_descriptor(1);
        assert_eq!(config.num_interfaces(), 2);
        assert_eq!(config.interfaces[0].len(), 2);
        assert_eq!(config.interfaces[0][1].endpoints[0].address, 0x83);
    }

    #[test]
    fn test_mock_string_decodes() {
        let raw = create_mock_string_descriptor("Widget");
        assert_eq!(raw[0] as usize, raw.len());
        assert_eq!(decode_string_descriptor(&raw).as_deref(), Some("Widget"));
    }

    #[test]
    fn test_mock_bos_decodes() {
        let raw = create_mock_bos(&[create_mock_usb2_extension(), create_mock_superspeed()]);
        let bos = decode_bos_descriptor(Bytes::from(raw)).unwrap();
        assert_eq!(bos.capabilities.len(), 2);
        assert!(bos.count_matches());
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result = with_timeout(Duration::from_millis(10), std::future::pending::<()>()).await;
        assert!(result.is_err());
        assert_eq!(with_timeout(DEFAULT_TEST_TIMEOUT, async { 7 }).await.unwrap(), 7);
    }
}
