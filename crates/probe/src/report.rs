//! Device summaries printed by the probe

use host::{Capability, Device, UsbError};
use protocol::{CapabilityType, DeviceCapability};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub bus_number: u8,
    pub device_address: u8,
    pub port_numbers: Vec<u8>,
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdUSB
    pub usb_version: u16,
    pub device_class: u8,
    pub num_configurations: u8,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub active_configuration: Option<u8>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<CapabilitySummary>,
    /// Why the device could not be read in full
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapabilitySummary {
    pub index: usize,
    pub capability_type: CapabilityType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decoded: Option<DeviceCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Capability> for CapabilitySummary {
    fn from(capability: &Capability) -> Self {
        let (decoded, error) = match capability.decode() {
            Ok(decoded) => (Some(decoded), None),
            Err(e) => (None, Some(e.to_string())),
        };
        Self {
            index: capability.index(),
            capability_type: capability.capability_type(),
            decoded,
            error,
        }
    }
}

/// Identity fields only; needs no open handle
pub fn identify(device: &Device) -> DeviceSummary {
    let descriptor = device.device_descriptor();
    DeviceSummary {
        bus_number: device.bus_number(),
        device_address: device.device_address(),
        port_numbers: device.port_numbers(),
        vendor_id: descriptor.vendor_id,
        product_id: descriptor.product_id,
        usb_version: descriptor.usb_version,
        device_class: descriptor.device_class,
        num_configurations: descriptor.num_configurations,
        manufacturer: None,
        product: None,
        serial_number: None,
        active_configuration: None,
        capabilities: Vec::new(),
        error: None,
    }
}

/// Open `device`, read its strings and capabilities, then close it
///
/// Failures are recorded in the summary instead of aborting the probe.
pub async fn describe(
    device: &mut Device,
    control_timeout: Duration,
    show_capabilities: bool,
) -> DeviceSummary {
    let mut summary = identify(device);

    if let Err(e) = device.open(false) {
        debug!(
            "Cannot open {:04x}:{:04x}: {}",
            summary.vendor_id, summary.product_id, e
        );
        summary.error = Some(format!("open failed: {}", e));
        return summary;
    }
    device.set_timeout(control_timeout);

    if let Err(e) = read_details(device, &mut summary, show_capabilities).await {
        warn!(
            "Failed to read {:04x}:{:04x}: {}",
            summary.vendor_id, summary.product_id, e
        );
        summary.error = Some(e.to_string());
    }

    device.close();
    summary
}

async fn read_details(
    device: &Device,
    summary: &mut DeviceSummary,
    show_capabilities: bool,
) -> Result<(), UsbError> {
    let descriptor = device.device_descriptor().clone();
    summary.manufacturer = read_string(device, descriptor.manufacturer_index).await?;
    summary.product = read_string(device, descriptor.product_index).await?;
    summary.serial_number = read_string(device, descriptor.serial_number_index).await?;

    summary.active_configuration = device
        .config_descriptor()?
        .map(|config| config.configuration_value);

    if show_capabilities {
        summary.capabilities = device
            .get_capabilities()
            .await?
            .iter()
            .map(CapabilitySummary::from)
            .collect();
    }
    Ok(())
}

/// Index 0 means the device has no such string
async fn read_string(device: &Device, index: u8) -> Result<Option<String>, UsbError> {
    if index == 0 {
        return Ok(None);
    }
    match device.get_string_descriptor(index).await {
        Err(e) if e.is_stall() => Ok(None),
        other => other,
    }
}

/// One human-readable block per device
pub fn render(summary: &DeviceSummary) -> String {
    let mut out = format!(
        "Bus {:03} Device {:03}: ID {:04x}:{:04x} {} {}\n",
        summary.bus_number,
        summary.device_address,
        summary.vendor_id,
        summary.product_id,
        summary
            .manufacturer
            .as_deref()
            .unwrap_or("Unknown Manufacturer"),
        summary.product.as_deref().unwrap_or("Unknown Product"),
    );

    let ports: Vec<String> = summary.port_numbers.iter().map(u8::to_string).collect();
    out.push_str(&format!(
        "    USB {}.{:02x}  class {:#04x}  ports {}\n",
        summary.usb_version >> 8,
        summary.usb_version & 0xFF,
        summary.device_class,
        if ports.is_empty() {
            "-".to_string()
        } else {
            ports.join(".")
        },
    ));

    if let Some(serial) = &summary.serial_number {
        out.push_str(&format!("    Serial: {}\n", serial));
    }
    if let Some(config) = summary.active_configuration {
        out.push_str(&format!(
            "    Configuration {} of {}\n",
            config, summary.num_configurations
        ));
    }

    for capability in &summary.capabilities {
        out.push_str(&format!(
            "    Capability {}: {}\n",
            capability.index,
            describe_capability(capability)
        ));
    }

    if let Some(error) = &summary.error {
        out.push_str(&format!("    Error: {}\n", error));
    }
    out
}

fn describe_capability(capability: &CapabilitySummary) -> String {
    match &capability.decoded {
        Some(DeviceCapability::Usb20Extension(ext)) => {
            format!("USB 2.0 Extension (LPM: {})", ext.supports_lpm())
        }
        Some(DeviceCapability::SuperSpeedUsb(ss)) => format!(
            "SuperSpeed USB (speeds {:#06x}, U1 {} us, U2 {} us)",
            ss.speeds_supported, ss.u1_exit_latency, ss.u2_exit_latency
        ),
        Some(DeviceCapability::ContainerId(id)) => {
            format!("Container ID {}", format_uuid(&id.uuid))
        }
        Some(DeviceCapability::Platform(platform)) => format!(
            "Platform {} ({} bytes)",
            format_uuid(&platform.uuid),
            platform.data.len()
        ),
        Some(DeviceCapability::Other {
            capability_type,
            data,
        }) => format!("{:?} ({} bytes)", capability_type, data.len()),
        None => format!(
            "{:?} (undecodable: {})",
            capability.capability_type,
            capability.error.as_deref().unwrap_or("unknown")
        ),
    }
}

/// UUID in the usual 8-4-4-4-12 grouping, bytes in wire order
fn format_uuid(bytes: &[u8; 16]) -> String {
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{create_mock_bos, create_mock_superspeed, create_mock_usb2_extension};
    use host::testing::{MockDevice, MockOp};
    use common::DeviceError;

    #[tokio::test]
    async fn test_describe_reads_strings_and_capabilities() {
        let mock = MockDevice::builder(0x1234, 0x5678)
            .usb_version(0x0210)
            .bus(3, 9)
            .ports(vec![1, 4])
            .string(1, "Acme")
            .string(2, "Widget")
            .string(3, "SN42")
            .bos(create_mock_bos(&[
                create_mock_usb2_extension(),
                create_mock_superspeed(),
            ]))
            .build();
        let mut device = Device::new(mock.clone());

        let summary = describe(&mut device, Duration::from_millis(500), true).await;
        assert_eq!(summary.error, None);
        assert_eq!(summary.manufacturer.as_deref(), Some("Acme"));
        assert_eq!(summary.product.as_deref(), Some("Widget"));
        assert_eq!(summary.serial_number.as_deref(), Some("SN42"));
        assert_eq!(summary.active_configuration, Some(1));
        assert_eq!(summary.capabilities.len(), 2);
        assert_eq!(
            summary.capabilities[1].capability_type,
            CapabilityType::SuperSpeedUsb
        );
        assert!(!device.is_open());
        assert!(!mock.is_open());

        let text = render(&summary);
        assert!(text.starts_with("Bus 003 Device 009: ID 1234:5678 Acme Widget"));
        assert!(text.contains("USB 2.10"));
        assert!(text.contains("ports 1.4"));
        assert!(text.contains("USB 2.0 Extension"));
    }

    #[tokio::test]
    async fn test_missing_strings_are_absent() {
        let mock = MockDevice::builder(0x1234, 0x5678).build();
        let mut device = Device::new(mock);

        let summary = describe(&mut device, Duration::from_millis(500), false).await;
        assert_eq!(summary.error, None);
        assert_eq!(summary.manufacturer, None);
        assert!(summary.capabilities.is_empty());
    }

    #[tokio::test]
    async fn test_open_failure_is_recorded() {
        let mock = MockDevice::builder(0x1234, 0x5678).build();
        mock.fail_operation(MockOp::Open, Some(DeviceError::Access));
        let mut device = Device::new(mock);

        let summary = describe(&mut device, Duration::from_millis(500), true).await;
        assert!(summary.error.unwrap().starts_with("open failed"));
        assert_eq!(summary.vendor_id, 0x1234);
    }

    #[test]
    fn test_summary_json_skips_empty_fields() {
        let mock = MockDevice::builder(0xabcd, 0x0001).build();
        let device = Device::new(mock);

        let json = serde_json::to_value(identify(&device)).unwrap();
        assert_eq!(json["vendor_id"], 0xabcd);
        assert!(json.get("capabilities").is_none());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_format_uuid() {
        let uuid: [u8; 16] = core::array::from_fn(|i| i as u8);
        assert_eq!(format_uuid(&uuid), "00010203-0405-0607-0809-0a0b0c0d0e0f");
    }
}
