//! libusb host
//!
//! Enumerates devices through a `rusb::Context` and turns libusb hotplug
//! callbacks into [`HotplugSink`] reports. libusb only invokes hotplug
//! callbacks from inside `handle_events`, so enabling delivery also starts an
//! event thread; disabling deregisters the callback and joins it.

use super::device::RusbDevice;
use super::transfers::map_rusb_error;
use super::UsbOptions;
use crate::backend::{DeviceBackend, HostBackend};
use crate::hotplug::HotplugSink;
use crate::lock;
use common::DeviceError;
use rusb::{Context, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

struct HotplugSession {
    registration: Registration<Context>,
    running: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Host backend over a libusb context
pub struct RusbHost {
    context: Context,
    options: UsbOptions,
    hotplug: Mutex<Option<HotplugSession>>,
}

impl RusbHost {
    pub fn new(options: UsbOptions) -> Result<Self, DeviceError> {
        let context = Context::new().map_err(|e| {
            error!("Failed to create libusb context: {}", e);
            map_rusb_error(e)
        })?;

        Ok(Self {
            context,
            options,
            hotplug: Mutex::new(None),
        })
    }

    /// Get USB context
    pub fn context(&self) -> &Context {
        &self.context
    }
}

impl HostBackend for RusbHost {
    fn devices(&self) -> Result<Vec<Arc<dyn DeviceBackend>>, DeviceError> {
        let list = self.context.devices().map_err(map_rusb_error)?;

        let mut devices: Vec<Arc<dyn DeviceBackend>> = Vec::with_capacity(list.len());
        for device in list.iter() {
            let (bus, address) = (device.bus_number(), device.address());
            match RusbDevice::new(device, self.options.clone()) {
                Ok(device) => devices.push(Arc::new(device)),
                Err(e) => warn!(
                    "Failed to add device during enumeration (bus={}, addr={}): {}",
                    bus, address, e
                ),
            }
        }

        debug!("Enumerated {} devices", devices.len());
        Ok(devices)
    }

    fn enable_hotplug(&self, sink: HotplugSink) -> Result<(), DeviceError> {
        if !rusb::has_hotplug() {
            warn!("libusb on this platform has no hotplug support");
            return Err(DeviceError::NotSupported);
        }

        let mut session = lock(&self.hotplug);
        if session.is_some() {
            return Ok(());
        }

        let callback = HotplugCallback {
            sink: sink.clone(),
            options: self.options.clone(),
        };
        let registration = HotplugBuilder::new()
            .enumerate(false)
            .register(&self.context, Box::new(callback))
            .map_err(map_rusb_error)?;

        let running = Arc::new(AtomicBool::new(true));
        let thread = {
            let context = self.context.clone();
            let running = running.clone();
            let interval = self.options.hotplug_poll_interval;
            std::thread::Builder::new()
                .name("usb-hotplug".to_string())
                .spawn(move || {
                    info!("Hotplug event thread started");
                    while running.load(Ordering::SeqCst) {
                        match context.handle_events(Some(interval)) {
                            Ok(()) => {}
                            Err(rusb::Error::Interrupted) => {
                                debug!("USB event handling interrupted");
                            }
                            Err(e) => {
                                warn!("Error handling USB events: {}", e);
                                sink.error(format!("hotplug event handling failed: {}", e));
                                std::thread::sleep(interval);
                            }
                        }
                    }
                    info!("Hotplug event thread stopped");
                })
                .map_err(|e| {
                    error!("Failed to spawn hotplug thread: {}", e);
                    DeviceError::Io
                })?
        };

        *session = Some(HotplugSession {
            registration,
            running,
            thread,
        });
        debug!("Hot-plug callbacks registered");
        Ok(())
    }

    fn disable_hotplug(&self) {
        let Some(session) = lock(&self.hotplug).take() else {
            return;
        };

        session.running.store(false, Ordering::SeqCst);
        drop(session.registration);
        join_event_thread(session.thread);
        debug!("Hot-plug callbacks deregistered");
    }
}

/// Wait for the event thread, unless we are running on it
///
/// The last context can be released from inside a hotplug callback. The
/// thread then leaves its loop once the current `handle_events` returns.
fn join_event_thread(thread: JoinHandle<()>) {
    if thread.thread().id() == std::thread::current().id() {
        debug!("Hotplug disabled from its own event thread");
        return;
    }
    if thread.join().is_err() {
        error!("Hotplug event thread panicked");
    }
}

impl Drop for RusbHost {
    fn drop(&mut self) {
        self.disable_hotplug();
    }
}

impl fmt::Debug for RusbHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RusbHost")
            .field("options", &self.options)
            .field("hotplug", &lock(&self.hotplug).is_some())
            .finish()
    }
}

/// Hot-plug callback handler
///
/// Wraps each notified device and forwards it to the sink. Runs on the
/// hotplug event thread.
struct HotplugCallback {
    sink: HotplugSink,
    options: UsbOptions,
}

impl HotplugCallback {
    fn wrap(&self, device: rusb::Device<Context>) -> Option<Arc<dyn DeviceBackend>> {
        let (bus, address) = (device.bus_number(), device.address());
        match RusbDevice::new(device, self.options.clone()) {
            Ok(device) => Some(Arc::new(device)),
            Err(e) => {
                warn!(
                    "Hot-plug callback: unreadable device (bus={}, addr={}): {}",
                    bus, address, e
                );
                self.sink
                    .error(format!("device {:03}:{:03} unreadable: {}", bus, address, e));
                None
            }
        }
    }
}

impl Hotplug<Context> for HotplugCallback {
    fn device_arrived(&mut self, device: rusb::Device<Context>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        if let Some(device) = self.wrap(device) {
            self.sink.device_arrived(device);
        }
    }

    fn device_left(&mut self, device: rusb::Device<Context>) {
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        if let Some(device) = self.wrap(device) {
            self.sink.device_left(device);
        }
    }
}
