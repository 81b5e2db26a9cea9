//! libusb device
//!
//! Wraps a `rusb::Device` with its cached device descriptor. While open it
//! owns the `DeviceHandle` and one [`TransferWorker`] per endpoint in use.

use super::transfers::{SharedHandle, map_rusb_error};
use super::worker::TransferWorker;
use super::{UsbOptions, read_lock, write_lock};
use crate::backend::{DeviceBackend, Rejected, SubmissionId, SubmitRequest};
use crate::lock;
use common::DeviceError;
use protocol::{
    ConfigDescriptor, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor, TransferKind,
};
use rusb::{Context, DeviceHandle};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};

/// USB device seen through libusb
pub struct RusbDevice {
    device: rusb::Device<Context>,
    descriptor: DeviceDescriptor,
    options: UsbOptions,
    handle: SharedHandle,
    workers: Mutex<HashMap<u8, TransferWorker>>,
}

impl RusbDevice {
    /// Create a new device wrapper
    ///
    /// Reads and caches the device descriptor.
    pub fn new(device: rusb::Device<Context>, options: UsbOptions) -> Result<Self, DeviceError> {
        let descriptor = device.device_descriptor().map_err(map_rusb_error)?;

        Ok(Self {
            descriptor: convert_device_descriptor(&descriptor),
            device,
            options,
            handle: Arc::new(RwLock::new(None)),
            workers: Mutex::new(HashMap::new()),
        })
    }

    fn label(&self) -> String {
        format!(
            "{:03}:{:03}",
            self.device.bus_number(),
            self.device.address()
        )
    }

    /// Run `f` with exclusive access to the open handle
    fn with_handle<T>(
        &self,
        f: impl FnOnce(&mut DeviceHandle<Context>) -> rusb::Result<T>,
    ) -> Result<T, DeviceError> {
        let mut guard = write_lock(&self.handle);
        let handle = guard.as_mut().ok_or(DeviceError::NoDevice)?;
        f(handle).map_err(map_rusb_error)
    }

    fn read_config(&self, index: u8) -> Result<ConfigDescriptor, DeviceError> {
        let config = self
            .device
            .config_descriptor(index)
            .map_err(map_rusb_error)?;
        Ok(convert_config_descriptor(&config, index))
    }
}

impl DeviceBackend for RusbDevice {
    fn bus_number(&self) -> u8 {
        self.device.bus_number()
    }

    fn address(&self) -> u8 {
        self.device.address()
    }

    fn port_numbers(&self) -> Vec<u8> {
        self.device.port_numbers().unwrap_or_else(|e| {
            debug!("No port path for {}: {}", self.label(), e);
            Vec::new()
        })
    }

    fn device_descriptor(&self) -> DeviceDescriptor {
        self.descriptor.clone()
    }

    fn open(&self) -> Result<(), DeviceError> {
        let mut guard = write_lock(&self.handle);
        if guard.is_some() {
            return Ok(());
        }

        let handle = self.device.open().map_err(|e| {
            warn!("Failed to open device {}: {}", self.label(), e);
            map_rusb_error(e)
        })?;
        *guard = Some(handle);

        debug!("Opened libusb handle for {}", self.label());
        Ok(())
    }

    fn close(&self) {
        let workers: Vec<TransferWorker> = lock(&self.workers).drain().map(|(_, w)| w).collect();
        for worker in &workers {
            worker.shutdown();
        }

        // Waits for in-progress read slices to let go of the handle
        if write_lock(&self.handle).take().is_some() {
            debug!(
                "Closed libusb handle for {} ({} workers stopped)",
                self.label(),
                workers.len()
            );
        }
    }

    fn active_config_descriptor(&self) -> Result<ConfigDescriptor, DeviceError> {
        let config = self
            .device
            .active_config_descriptor()
            .map_err(map_rusb_error)?;

        let value = config.number();
        let index = (0..self.descriptor.num_configurations)
            .find(|&i| {
                self.device
                    .config_descriptor(i)
                    .is_ok_and(|candidate| candidate.number() == value)
            })
            .unwrap_or_else(|| value.saturating_sub(1));

        Ok(convert_config_descriptor(&config, index))
    }

    fn config_descriptors(&self) -> Result<Vec<ConfigDescriptor>, DeviceError> {
        (0..self.descriptor.num_configurations)
            .map(|index| self.read_config(index))
            .collect()
    }

    fn parent(&self) -> Option<Arc<dyn DeviceBackend>> {
        let parent = self.device.get_parent()?;
        match RusbDevice::new(parent, self.options.clone()) {
            Ok(device) => Some(Arc::new(device)),
            Err(e) => {
                warn!("Failed to read parent of {}: {}", self.label(), e);
                None
            }
        }
    }

    fn set_configuration(&self, value: u8) -> Result<(), DeviceError> {
        self.with_handle(|handle| handle.set_active_configuration(value))
    }

    fn claim_interface(&self, interface: u8) -> Result<(), DeviceError> {
        self.with_handle(|handle| handle.claim_interface(interface))
    }

    fn release_interface(&self, interface: u8) -> Result<(), DeviceError> {
        self.with_handle(|handle| handle.release_interface(interface))
    }

    fn set_alternate_setting(&self, interface: u8, setting: u8) -> Result<(), DeviceError> {
        self.with_handle(|handle| handle.set_alternate_setting(interface, setting))
    }

    fn clear_halt(&self, endpoint: u8) -> Result<(), DeviceError> {
        self.with_handle(|handle| handle.clear_halt(endpoint))
    }

    fn kernel_driver_active(&self, interface: u8) -> Result<bool, DeviceError> {
        let guard = read_lock(&self.handle);
        let handle = guard.as_ref().ok_or(DeviceError::NoDevice)?;
        handle
            .kernel_driver_active(interface)
            .map_err(map_rusb_error)
    }

    fn detach_kernel_driver(&self, interface: u8) -> Result<(), DeviceError> {
        self.with_handle(|handle| handle.detach_kernel_driver(interface))
    }

    fn attach_kernel_driver(&self, interface: u8) -> Result<(), DeviceError> {
        self.with_handle(|handle| handle.attach_kernel_driver(interface))
    }

    fn reset(&self) -> Result<(), DeviceError> {
        self.with_handle(|handle| handle.reset())
    }

    fn submit(&self, request: SubmitRequest) -> Result<(), Rejected> {
        if request.kind == TransferKind::Isochronous {
            return Err(Rejected::new(DeviceError::NotSupported, request));
        }
        if read_lock(&self.handle).is_none() {
            return Err(Rejected::new(DeviceError::NoDevice, request));
        }

        let mut workers = lock(&self.workers);
        let endpoint = request.endpoint;
        if !workers.contains_key(&endpoint) {
            let name = format!("usb-xfer-{}-ep{:02x}", self.label(), endpoint);
            match TransferWorker::spawn(
                name,
                self.handle.clone(),
                self.options.queue_depth,
                self.options.poll_slice,
            ) {
                Ok(worker) => {
                    workers.insert(endpoint, worker);
                }
                Err(e) => {
                    warn!("Failed to spawn transfer worker: {}", e);
                    return Err(Rejected::new(DeviceError::Io, request));
                }
            }
        }

        let Some(worker) = workers.get(&endpoint) else {
            return Err(Rejected::new(DeviceError::NoDevice, request));
        };
        worker
            .enqueue(request)
            .map_err(|(error, request)| Rejected::new(error, request))
    }

    fn cancel(&self, id: SubmissionId) -> bool {
        lock(&self.workers)
            .values()
            .any(|worker| worker.cancel(id))
    }
}

impl Drop for RusbDevice {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for RusbDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RusbDevice")
            .field("bus_number", &self.device.bus_number())
            .field("address", &self.device.address())
            .field("vendor_id", &format_args!("{:#06x}", self.descriptor.vendor_id))
            .field("product_id", &format_args!("{:#06x}", self.descriptor.product_id))
            .finish()
    }
}

/// rusb version triple to BCD, e.g. 2.1.0 to `0x0210`
fn version_to_bcd(version: rusb::Version) -> u16 {
    let major = u16::from(version.major());
    ((major / 10) << 12)
        | ((major % 10) << 8)
        | (u16::from(version.minor() & 0x0F) << 4)
        | u16::from(version.sub_minor() & 0x0F)
}

fn convert_device_descriptor(descriptor: &rusb::DeviceDescriptor) -> DeviceDescriptor {
    DeviceDescriptor {
        usb_version: version_to_bcd(descriptor.usb_version()),
        device_class: descriptor.class_code(),
        device_subclass: descriptor.sub_class_code(),
        device_protocol: descriptor.protocol_code(),
        max_packet_size0: descriptor.max_packet_size(),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        device_version: version_to_bcd(descriptor.device_version()),
        manufacturer_index: descriptor.manufacturer_string_index().unwrap_or(0),
        product_index: descriptor.product_string_index().unwrap_or(0),
        serial_number_index: descriptor.serial_number_string_index().unwrap_or(0),
        num_configurations: descriptor.num_configurations(),
    }
}

fn convert_config_descriptor(config: &rusb::ConfigDescriptor, index: u8) -> ConfigDescriptor {
    let attributes = 0x80
        | if config.self_powered() { 0x40 } else { 0 }
        | if config.remote_wakeup() { 0x20 } else { 0 };

    ConfigDescriptor {
        configuration_value: config.number(),
        configuration_index: index,
        attributes,
        max_power_ma: config.max_power(),
        interfaces: config
            .interfaces()
            .map(|interface| {
                interface
                    .descriptors()
                    .map(|alt| convert_interface_descriptor(&alt))
                    .collect()
            })
            .collect(),
    }
}

fn convert_interface_descriptor(alt: &rusb::InterfaceDescriptor<'_>) -> InterfaceDescriptor {
    InterfaceDescriptor {
        interface_number: alt.interface_number(),
        alternate_setting: alt.setting_number(),
        interface_class: alt.class_code(),
        interface_subclass: alt.sub_class_code(),
        interface_protocol: alt.protocol_code(),
        interface_index: alt.description_string_index().unwrap_or(0),
        endpoints: alt
            .endpoint_descriptors()
            .map(|ep| EndpointDescriptor {
                address: ep.address(),
                attributes: endpoint_attributes(
                    ep.transfer_type(),
                    ep.sync_type(),
                    ep.usage_type(),
                ),
                max_packet_size: ep.max_packet_size(),
                interval: ep.interval(),
            })
            .collect(),
    }
}

/// Rebuild `bmAttributes` from rusb's decoded fields
fn endpoint_attributes(
    transfer_type: rusb::TransferType,
    sync_type: rusb::SyncType,
    usage_type: rusb::UsageType,
) -> u8 {
    let transfer = match transfer_type {
        rusb::TransferType::Control => 0,
        rusb::TransferType::Isochronous => 1,
        rusb::TransferType::Bulk => 2,
        rusb::TransferType::Interrupt => 3,
    };
    let sync = match sync_type {
        rusb::SyncType::NoSync => 0,
        rusb::SyncType::Asynchronous => 1,
        rusb::SyncType::Adaptive => 2,
        rusb::SyncType::Synchronous => 3,
    };
    let usage = match usage_type {
        rusb::UsageType::Data => 0,
        rusb::UsageType::Feedback => 1,
        rusb::UsageType::FeedbackData => 2,
        rusb::UsageType::Reserved => 3,
    };
    transfer | (sync << 2) | (usage << 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_to_bcd() {
        assert_eq!(version_to_bcd(rusb::Version(2, 1, 0)), 0x0210);
        assert_eq!(version_to_bcd(rusb::Version(2, 0, 1)), 0x0201);
        assert_eq!(version_to_bcd(rusb::Version(3, 2, 0)), 0x0320);
        assert_eq!(version_to_bcd(rusb::Version(1, 1, 0)), 0x0110);
    }

    #[test]
    fn test_endpoint_attributes() {
        assert_eq!(
            endpoint_attributes(
                rusb::TransferType::Bulk,
                rusb::SyncType::NoSync,
                rusb::UsageType::Data
            ),
            0x02
        );
        assert_eq!(
            endpoint_attributes(
                rusb::TransferType::Isochronous,
                rusb::SyncType::Asynchronous,
                rusb::UsageType::Feedback
            ),
            0x15
        );
        assert_eq!(
            TransferKind::from_attributes(endpoint_attributes(
                rusb::TransferType::Interrupt,
                rusb::SyncType::NoSync,
                rusb::UsageType::Data
            )),
            TransferKind::Interrupt
        );
    }
}
