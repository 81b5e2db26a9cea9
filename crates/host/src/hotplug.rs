//! Hotplug event registry
//!
//! Platform hotplug delivery is enabled only while at least one attach or
//! detach listener is registered. The first such subscription enables it and
//! dropping the last one disables it. Error listeners do not count.

use crate::backend::{DeviceBackend, HostBackend};
use crate::device::Device;
use crate::lock;
use common::UsbError;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

/// Capacity of each subscription's event queue
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Kind of event a [`Subscription`] receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Attach,
    Detach,
    Error,
}

impl EventKind {
    /// Whether listeners of this kind keep hotplug delivery enabled
    pub fn toggles_hotplug(self) -> bool {
        matches!(self, EventKind::Attach | EventKind::Detach)
    }
}

/// Event delivered to subscribers
#[derive(Debug)]
pub enum UsbEvent {
    /// A device was attached; it starts closed
    Attach(Device),
    /// A device was removed
    Detach(Device),
    /// The hotplug engine reported a failure
    Error(String),
}

impl UsbEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            UsbEvent::Attach(_) => EventKind::Attach,
            UsbEvent::Detach(_) => EventKind::Detach,
            UsbEvent::Error(_) => EventKind::Error,
        }
    }
}

struct Listener {
    kind: EventKind,
    tx: async_channel::Sender<UsbEvent>,
}

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    listeners: HashMap<u64, Listener>,
    hotplug_listeners: usize,
}

/// Listener table of one [`Usb`](crate::Usb) context
pub(crate) struct Registry {
    backend: Arc<dyn HostBackend>,
    /// Serializes enable/disable transitions
    toggle: Mutex<()>,
    state: Mutex<RegistryState>,
    this: Weak<Registry>,
}

impl Registry {
    pub(crate) fn new(backend: Arc<dyn HostBackend>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            backend,
            toggle: Mutex::new(()),
            state: Mutex::new(RegistryState::default()),
            this: this.clone(),
        })
    }

    pub(crate) fn subscribe(&self, kind: EventKind) -> Result<Subscription, UsbError> {
        let (tx, rx) = async_channel::bounded(EVENT_CHANNEL_CAPACITY);
        let _toggle = lock(&self.toggle);

        if kind.toggles_hotplug() && lock(&self.state).hotplug_listeners == 0 {
            self.backend.enable_hotplug(HotplugSink {
                registry: self.this.clone(),
            })?;
            info!("Hotplug delivery enabled");
        }

        let mut state = lock(&self.state);
        if kind.toggles_hotplug() {
            state.hotplug_listeners += 1;
        }
        let id = state.next_id;
        state.next_id += 1;
        state.listeners.insert(id, Listener { kind, tx });
        debug!("Registered {:?} listener {}", kind, id);

        Ok(Subscription {
            id,
            kind,
            rx,
            registry: self.this.clone(),
        })
    }

    fn unsubscribe(&self, id: u64) {
        let _toggle = lock(&self.toggle);

        let disable = {
            let mut state = lock(&self.state);
            let Some(listener) = state.listeners.remove(&id) else {
                return;
            };
            debug!("Removed {:?} listener {}", listener.kind, id);

            if listener.kind.toggles_hotplug() {
                state.hotplug_listeners -= 1;
                state.hotplug_listeners == 0
            } else {
                false
            }
        };

        // The engine may join its event thread here, which can be waiting on
        // the state lock inside a dispatch.
        if disable {
            self.backend.disable_hotplug();
            info!("Hotplug delivery disabled");
        }
    }

    pub(crate) fn hotplug_enabled(&self) -> bool {
        lock(&self.state).hotplug_listeners > 0
    }

    pub(crate) fn listener_count(&self, kind: EventKind) -> usize {
        lock(&self.state)
            .listeners
            .values()
            .filter(|listener| listener.kind == kind)
            .count()
    }

    fn senders(&self, kind: EventKind) -> Vec<async_channel::Sender<UsbEvent>> {
        lock(&self.state)
            .listeners
            .values()
            .filter(|listener| listener.kind == kind)
            .map(|listener| listener.tx.clone())
            .collect()
    }

    fn dispatch(&self, kind: EventKind, make_event: impl Fn() -> UsbEvent) {
        for tx in self.senders(kind) {
            if let Err(e) = tx.try_send(make_event()) {
                warn!("Dropping {:?} event: {}", kind, e);
            }
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        if self.hotplug_enabled() {
            self.backend.disable_hotplug();
            debug!("Hotplug delivery disabled with its context");
        }
    }
}

/// Where the engine reports hotplug notifications
///
/// Handed to [`HostBackend::enable_hotplug`]. Reports after the owning
/// context is gone are ignored.
#[derive(Clone)]
pub struct HotplugSink {
    registry: Weak<Registry>,
}

impl HotplugSink {
    pub fn device_arrived(&self, device: Arc<dyn DeviceBackend>) {
        if let Some(registry) = self.registry.upgrade() {
            debug!(
                "Hotplug: device arrived (bus={}, addr={})",
                device.bus_number(),
                device.address()
            );
            registry.dispatch(EventKind::Attach, || {
                UsbEvent::Attach(Device::new(device.clone()))
            });
        }
    }

    pub fn device_left(&self, device: Arc<dyn DeviceBackend>) {
        if let Some(registry) = self.registry.upgrade() {
            debug!(
                "Hotplug: device left (bus={}, addr={})",
                device.bus_number(),
                device.address()
            );
            registry.dispatch(EventKind::Detach, || {
                UsbEvent::Detach(Device::new(device.clone()))
            });
        }
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        if let Some(registry) = self.registry.upgrade() {
            registry.dispatch(EventKind::Error, || UsbEvent::Error(message.clone()));
        }
    }
}

impl fmt::Debug for HotplugSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HotplugSink")
            .field("connected", &(self.registry.strong_count() > 0))
            .finish()
    }
}

/// Registered listener; dropping it unregisters
pub struct Subscription {
    id: u64,
    kind: EventKind,
    rx: async_channel::Receiver<UsbEvent>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Wait for the next event
    pub async fn recv(&self) -> Option<UsbEvent> {
        self.rx.recv().await.ok()
    }

    pub fn try_recv(&self) -> Option<UsbEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockHost;

    #[test]
    fn test_only_attach_detach_toggle() {
        assert!(EventKind::Attach.toggles_hotplug());
        assert!(EventKind::Detach.toggles_hotplug());
        assert!(!EventKind::Error.toggles_hotplug());
    }

    #[test]
    fn test_enable_on_first_disable_on_last() {
        let host = MockHost::new();
        let registry = Registry::new(host.clone());

        let attach = registry.subscribe(EventKind::Attach).unwrap();
        let detach = registry.subscribe(EventKind::Detach).unwrap();
        assert_eq!(host.enable_count(), 1);
        assert!(registry.hotplug_enabled());

        drop(attach);
        assert_eq!(host.disable_count(), 0);
        drop(detach);
        assert_eq!(host.disable_count(), 1);
        assert!(!registry.hotplug_enabled());
    }

    #[test]
    fn test_failed_enable_registers_nothing() {
        let host = MockHost::new();
        host.fail_enable(Some(common::DeviceError::NotSupported));
        let registry = Registry::new(host.clone());

        assert!(registry.subscribe(EventKind::Attach).is_err());
        assert_eq!(registry.listener_count(EventKind::Attach), 0);
        assert!(!registry.hotplug_enabled());
    }
}
