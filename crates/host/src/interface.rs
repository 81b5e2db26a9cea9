//! Interfaces of the active configuration
//!
//! An [`Interface`] is a cheap handle; clones refer to the same interface.
//! Handles stay valid until the owning device is closed or reconfigured, after
//! which every operation fails with [`UsbError::InvalidState`].

use crate::backend::DeviceBackend;
use crate::endpoint::Endpoint;
use crate::{lock, run_blocking};
use common::UsbError;
use protocol::InterfaceDescriptor;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug)]
struct InterfaceState {
    alt_setting: u8,
    claimed: bool,
    valid: bool,
    endpoints: Vec<Endpoint>,
}

struct InterfaceInner {
    backend: Arc<dyn DeviceBackend>,
    index: usize,
    interface_number: u8,
    alt_settings: Vec<InterfaceDescriptor>,
    state: Mutex<InterfaceState>,
}

/// One interface of an open device
#[derive(Clone)]
pub struct Interface {
    inner: Arc<InterfaceInner>,
}

impl Interface {
    /// `alt_settings` holds every alternate setting of the interface, as found
    /// in the configuration descriptor
    pub(crate) fn new(
        backend: Arc<dyn DeviceBackend>,
        index: usize,
        alt_settings: Vec<InterfaceDescriptor>,
    ) -> Self {
        let interface_number = alt_settings
            .first()
            .map(|alt| alt.interface_number)
            .unwrap_or(index as u8);
        let endpoints = build_endpoints(&backend, &alt_settings, 0, false);

        Self {
            inner: Arc::new(InterfaceInner {
                backend,
                index,
                interface_number,
                alt_settings,
                state: Mutex::new(InterfaceState {
                    alt_setting: 0,
                    claimed: false,
                    valid: true,
                    endpoints,
                }),
            }),
        }
    }

    /// Position in the configuration descriptor
    pub fn index(&self) -> usize {
        self.inner.index
    }

    /// `bInterfaceNumber`
    pub fn interface_number(&self) -> u8 {
        self.inner.interface_number
    }

    /// Current alternate setting
    pub fn alt_setting(&self) -> u8 {
        lock(&self.inner.state).alt_setting
    }

    pub fn is_claimed(&self) -> bool {
        lock(&self.inner.state).claimed
    }

    /// `false` once the device was closed or reconfigured
    pub fn is_valid(&self) -> bool {
        lock(&self.inner.state).valid
    }

    /// Descriptor for the current alternate setting
    pub fn descriptor(&self) -> Option<InterfaceDescriptor> {
        let alt = self.alt_setting();
        find_alt(&self.inner.alt_settings, alt).cloned()
    }

    /// Descriptors for every alternate setting
    pub fn alt_settings(&self) -> &[InterfaceDescriptor] {
        &self.inner.alt_settings
    }

    /// Endpoints of the current alternate setting, in descriptor order
    pub fn endpoints(&self) -> Vec<Endpoint> {
        lock(&self.inner.state).endpoints.clone()
    }

    /// Endpoint with the given address
    pub fn endpoint(&self, address: u8) -> Option<Endpoint> {
        lock(&self.inner.state)
            .endpoints
            .iter()
            .find(|ep| ep.address() == address)
            .cloned()
    }

    /// Claim the interface so its endpoints can be used
    pub fn claim(&self) -> Result<(), UsbError> {
        let mut state = lock(&self.inner.state);
        ensure_valid(&state)?;
        if state.claimed {
            return Ok(());
        }

        self.inner
            .backend
            .claim_interface(self.inner.interface_number)?;
        state.claimed = true;
        for ep in &state.endpoints {
            ep.set_usable(true);
        }

        info!("Claimed interface {}", self.inner.interface_number);
        Ok(())
    }

    /// Release the interface
    ///
    /// With transfers pending and `close_endpoints` unset this fails with
    /// [`UsbError::InvalidState`]. With `close_endpoints` set, every in-flight
    /// transfer is cancelled and waited for first. On success the alternate
    /// setting is back to 0.
    pub async fn release(&self, close_endpoints: bool) -> Result<(), UsbError> {
        let endpoints = {
            let state = lock(&self.inner.state);
            ensure_valid(&state)?;
            if !state.claimed {
                return Err(UsbError::invalid_state("interface is not claimed"));
            }
            state.endpoints.clone()
        };

        let pending: usize = endpoints.iter().map(|ep| ep.pending_transfers()).sum();
        if pending > 0 && !close_endpoints {
            return Err(UsbError::invalid_state(format!(
                "interface {} has {} pending transfers",
                self.inner.interface_number, pending
            )));
        }

        for ep in &endpoints {
            ep.set_usable(false);
        }

        if close_endpoints {
            for ep in &endpoints {
                let cancelled = ep.cancel_in_flight();
                if cancelled > 0 {
                    debug!(
                        "Cancelled {} transfers on endpoint {:#04x}",
                        cancelled,
                        ep.address()
                    );
                }
            }
            for ep in &endpoints {
                ep.shared().wait_drained().await;
            }
        }

        let backend = self.inner.backend.clone();
        let number = self.inner.interface_number;
        if let Err(e) = run_blocking(move || backend.release_interface(number)).await {
            warn!("Failed to release interface {}: {}", number, e);
            let state = lock(&self.inner.state);
            if state.valid && state.claimed {
                for ep in &state.endpoints {
                    ep.set_usable(true);
                }
            }
            return Err(e);
        }

        let mut state = lock(&self.inner.state);
        state.claimed = false;
        state.alt_setting = 0;
        state.endpoints = build_endpoints(&self.inner.backend, &self.inner.alt_settings, 0, false);

        info!("Released interface {}", number);
        Ok(())
    }

    /// Select alternate setting `alt_setting`
    ///
    /// The interface must be claimed and have no pending transfers. On success
    /// the endpoint list is rebuilt and old endpoint handles become unusable;
    /// on failure nothing changes.
    pub async fn set_alt_setting(&self, alt_setting: u8) -> Result<(), UsbError> {
        {
            let state = lock(&self.inner.state);
            ensure_valid(&state)?;
            if !state.claimed {
                return Err(UsbError::invalid_state("interface is not claimed"));
            }
            if find_alt(&self.inner.alt_settings, alt_setting).is_none() {
                return Err(UsbError::invalid_argument(format!(
                    "interface {} has no alternate setting {}",
                    self.inner.interface_number, alt_setting
                )));
            }
            if state.endpoints.iter().any(|ep| ep.pending_transfers() > 0) {
                return Err(UsbError::invalid_state(
                    "cannot change alternate setting while transfers are pending",
                ));
            }
        }

        let backend = self.inner.backend.clone();
        let number = self.inner.interface_number;
        run_blocking(move || backend.set_alternate_setting(number, alt_setting)).await?;

        let mut state = lock(&self.inner.state);
        ensure_valid(&state)?;
        for ep in &state.endpoints {
            ep.stop_poll();
            ep.set_usable(false);
        }
        state.endpoints = build_endpoints(
            &self.inner.backend,
            &self.inner.alt_settings,
            alt_setting,
            state.claimed,
        );
        state.alt_setting = alt_setting;

        info!(
            "Interface {} switched to alternate setting {}",
            number, alt_setting
        );
        Ok(())
    }

    pub fn is_kernel_driver_active(&self) -> Result<bool, UsbError> {
        ensure_valid(&lock(&self.inner.state))?;
        Ok(self
            .inner
            .backend
            .kernel_driver_active(self.inner.interface_number)?)
    }

    pub fn detach_kernel_driver(&self) -> Result<(), UsbError> {
        ensure_valid(&lock(&self.inner.state))?;
        self.inner
            .backend
            .detach_kernel_driver(self.inner.interface_number)?;
        debug!(
            "Detached kernel driver from interface {}",
            self.inner.interface_number
        );
        Ok(())
    }

    pub fn attach_kernel_driver(&self) -> Result<(), UsbError> {
        ensure_valid(&lock(&self.inner.state))?;
        self.inner
            .backend
            .attach_kernel_driver(self.inner.interface_number)?;
        debug!(
            "Reattached kernel driver to interface {}",
            self.inner.interface_number
        );
        Ok(())
    }

    /// Mark the handle stale after close or reconfiguration
    pub(crate) fn invalidate(&self) {
        let mut state = lock(&self.inner.state);
        state.valid = false;
        state.claimed = false;
        for ep in &state.endpoints {
            ep.set_usable(false);
            ep.cancel_in_flight();
        }
    }
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("Interface")
            .field("index", &self.inner.index)
            .field("interface_number", &self.inner.interface_number)
            .field("alt_setting", &state.alt_setting)
            .field("claimed", &state.claimed)
            .field("valid", &state.valid)
            .finish()
    }
}

fn ensure_valid(state: &InterfaceState) -> Result<(), UsbError> {
    if state.valid {
        Ok(())
    } else {
        Err(UsbError::invalid_state(
            "interface handle is stale: device closed or reconfigured",
        ))
    }
}

fn find_alt(alt_settings: &[InterfaceDescriptor], alt: u8) -> Option<&InterfaceDescriptor> {
    alt_settings.iter().find(|d| d.alternate_setting == alt)
}

fn build_endpoints(
    backend: &Arc<dyn DeviceBackend>,
    alt_settings: &[InterfaceDescriptor],
    alt: u8,
    usable: bool,
) -> Vec<Endpoint> {
    find_alt(alt_settings, alt)
        .map(|desc| {
            desc.endpoints
                .iter()
                .map(|ep| Endpoint::new(backend.clone(), *ep, usable))
                .collect()
        })
        .unwrap_or_default()
}
