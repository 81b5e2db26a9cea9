//! Host context
//!
//! [`Usb`] is the entry point of the crate: it enumerates attached devices
//! through a [`HostBackend`] and owns the hotplug listener registry.

use crate::backend::HostBackend;
use crate::device::Device;
use crate::engine::{RusbHost, UsbOptions};
use crate::hotplug::{EventKind, Registry, Subscription};
use common::UsbError;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Access to the USB devices of one host
///
/// Create one `Usb` per process and share it. Hotplug delivery is enabled
/// exactly while this context has at least one attach or detach
/// [`Subscription`]: the first such subscription turns it on, and dropping the
/// last one or the context itself turns it off. Error subscriptions alone
/// never enable it. Each context keeps its own listener registry, so a second
/// context does not see the first one's subscriptions.
pub struct Usb {
    backend: Arc<dyn HostBackend>,
    registry: Arc<Registry>,
}

impl Usb {
    /// Use `backend` for enumeration and hotplug delivery
    pub fn new(backend: Arc<dyn HostBackend>) -> Self {
        let registry = Registry::new(backend.clone());
        Self { backend, registry }
    }

    /// Context backed by libusb
    pub fn with_libusb(options: UsbOptions) -> Result<Self, UsbError> {
        let host = RusbHost::new(options)?;
        Ok(Self::new(Arc::new(host)))
    }

    /// Currently attached devices, all closed
    pub fn devices(&self) -> Result<Vec<Device>, UsbError> {
        let devices: Vec<Device> = self
            .backend
            .devices()?
            .into_iter()
            .map(Device::new)
            .collect();
        debug!("Enumerated {} devices", devices.len());
        Ok(devices)
    }

    /// First device with the given vendor and product IDs
    pub fn find_by_ids(&self, vendor_id: u16, product_id: u16) -> Result<Option<Device>, UsbError> {
        Ok(self.devices()?.into_iter().find(|device| {
            let descriptor = device.device_descriptor();
            descriptor.vendor_id == vendor_id && descriptor.product_id == product_id
        }))
    }

    /// First device whose serial number string equals `serial_number`
    ///
    /// Each candidate is opened to read its serial number and closed again.
    /// Devices that cannot be opened are skipped.
    pub async fn find_by_serial_number(
        &self,
        serial_number: &str,
    ) -> Result<Option<Device>, UsbError> {
        for mut device in self.devices()? {
            let index = device.device_descriptor().serial_number_index;
            if index == 0 {
                continue;
            }

            if let Err(e) = device.open(false) {
                debug!("Skipping {:?} in serial lookup: {}", device, e);
                continue;
            }
            let serial = device.get_string_descriptor(index).await;
            device.close();

            match serial {
                Ok(Some(serial)) if serial == serial_number => return Ok(Some(device)),
                Ok(_) => {}
                Err(e) => warn!("Failed to read serial number of {:?}: {}", device, e),
            }
        }
        Ok(None)
    }

    /// Register a listener for `kind` events
    ///
    /// The first attach or detach listener enables platform hotplug delivery;
    /// dropping the last one disables it.
    pub fn subscribe(&self, kind: EventKind) -> Result<Subscription, UsbError> {
        self.registry.subscribe(kind)
    }

    /// Whether hotplug delivery is currently enabled
    pub fn hotplug_enabled(&self) -> bool {
        self.registry.hotplug_enabled()
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.registry.listener_count(kind)
    }
}

impl fmt::Debug for Usb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Usb")
            .field("hotplug_enabled", &self.hotplug_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockDevice, MockHost};

    fn context() -> (Arc<MockHost>, Usb) {
        let host = MockHost::new();
        host.add_device(MockDevice::builder(0x1234, 0x0001).bus(1, 2).build());
        host.add_device(
            MockDevice::builder(0x1234, 0x0002)
                .bus(1, 3)
                .string(3, "SN-0002")
                .build(),
        );
        let usb = Usb::new(host.clone());
        (host, usb)
    }

    #[test]
    fn test_find_by_ids() {
        let (_host, usb) = context();
        assert_eq!(usb.devices().unwrap().len(), 2);

        let device = usb.find_by_ids(0x1234, 0x0002).unwrap().unwrap();
        assert_eq!(device.device_address(), 3);
        assert!(!device.is_open());
        assert!(usb.find_by_ids(0xFFFF, 0x0002).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_by_serial_number() {
        let (_host, usb) = context();
        let device = usb.find_by_serial_number("SN-0002").await.unwrap().unwrap();
        assert_eq!(device.device_descriptor().product_id, 0x0002);
        assert!(!device.is_open());

        assert!(usb.find_by_serial_number("missing").await.unwrap().is_none());
    }
}
