//! USB device handle
//!
//! A [`Device`] wraps one [`DeviceBackend`] and adds the descriptor caches, the
//! open/close lifecycle and the interface list of the active configuration.
//!
//! ```text
//! closed ──open()──▶ opened ──set_configuration()──▶ opened (new interfaces)
//!   ▲                  │
//!   └─────close()──────┘
//! ```

use crate::backend::DeviceBackend;
use crate::capability::Capability;
use crate::interface::Interface;
use crate::run_blocking;
use crate::transfer::{Transfer, TransferFuture};
use bytes::Bytes;
use common::{DeviceError, UsbError};
use protocol::{
    BOS_HEADER_SIZE, BOS_MIN_USB_VERSION, BosDescriptor, CONTROL_SETUP_SIZE, ConfigDescriptor,
    ControlData, DeviceDescriptor, Direction, ENDPOINT_IN, LANGUAGE_ID_EN_US,
    MAX_STRING_DESCRIPTOR_LENGTH, TransferKind, decode_bos_descriptor, decode_bos_header,
    decode_string_descriptor, descriptor_type, encode_control_transfer, request,
};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll, ready};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Default timeout for control transfers
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);

/// A USB device
pub struct Device {
    backend: Arc<dyn DeviceBackend>,
    descriptor: DeviceDescriptor,
    timeout: Duration,
    open: bool,
    interfaces: Option<Vec<Interface>>,
    config_descriptor: OnceLock<Option<ConfigDescriptor>>,
    all_config_descriptors: OnceLock<Vec<ConfigDescriptor>>,
    parent: OnceLock<Option<Arc<dyn DeviceBackend>>>,
    bos: OnceCell<Option<Arc<BosDescriptor>>>,
}

impl Device {
    /// Wrap a backend device; the device starts closed
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        let descriptor = backend.device_descriptor();
        Self {
            backend,
            descriptor,
            timeout: DEFAULT_CONTROL_TIMEOUT,
            open: false,
            interfaces: None,
            config_descriptor: OnceLock::new(),
            all_config_descriptors: OnceLock::new(),
            parent: OnceLock::new(),
            bos: OnceCell::new(),
        }
    }

    pub fn bus_number(&self) -> u8 {
        self.backend.bus_number()
    }

    pub fn device_address(&self) -> u8 {
        self.backend.address()
    }

    /// Port path from the root hub
    pub fn port_numbers(&self) -> Vec<u8> {
        self.backend.port_numbers()
    }

    pub fn device_descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Timeout applied to control transfers
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Active configuration descriptor
    ///
    /// `None` when the device is unconfigured. The first answer is kept until
    /// the configuration changes.
    pub fn config_descriptor(&self) -> Result<Option<&ConfigDescriptor>, UsbError> {
        if let Some(cached) = self.config_descriptor.get() {
            return Ok(cached.as_ref());
        }

        let fetched = match self.backend.active_config_descriptor() {
            Ok(config) => Some(config),
            Err(DeviceError::NotFound) => None,
            Err(e) => return Err(e.into()),
        };
        Ok(self.config_descriptor.get_or_init(|| fetched).as_ref())
    }

    /// Every configuration descriptor of the device
    pub fn all_config_descriptors(&self) -> Result<&[ConfigDescriptor], UsbError> {
        if let Some(cached) = self.all_config_descriptors.get() {
            return Ok(cached);
        }

        let fetched = match self.backend.config_descriptors() {
            Ok(configs) => configs,
            Err(DeviceError::NotFound) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(self.all_config_descriptors.get_or_init(|| fetched))
    }

    /// Upstream hub, if any
    pub fn parent(&self) -> Option<Device> {
        self.parent
            .get_or_init(|| self.backend.parent())
            .as_ref()
            .map(|backend| Device::new(backend.clone()))
    }

    /// Acquire the OS handle
    ///
    /// With `auto_configure` the interface list is built from the active
    /// configuration. On failure the device stays closed.
    pub fn open(&mut self, auto_configure: bool) -> Result<(), UsbError> {
        if self.open {
            return Ok(());
        }

        self.backend.open().map_err(|e| {
            warn!("Failed to open device {}: {}", self.label(), e);
            UsbError::from(e)
        })?;
        self.open = true;
        self.interfaces = None;

        if auto_configure && let Err(e) = self.build_interfaces() {
            warn!("Failed to read interfaces of {}: {}", self.label(), e);
            self.backend.close();
            self.open = false;
            return Err(e);
        }

        info!("Opened device {}", self.label());
        Ok(())
    }

    /// Release the OS handle; every interface handle becomes stale
    pub fn close(&mut self) {
        if !self.open {
            return;
        }

        if let Some(interfaces) = self.interfaces.take() {
            for interface in &interfaces {
                interface.invalidate();
            }
        }
        self.backend.close();
        self.open = false;
        info!("Closed device {}", self.label());
    }

    /// Select configuration `value` and rebuild the interface list
    ///
    /// Interfaces obtained before the call become stale. On failure the
    /// previous interfaces stay in place.
    pub async fn set_configuration(&mut self, value: u8) -> Result<(), UsbError> {
        self.ensure_open()?;

        let backend = self.backend.clone();
        run_blocking(move || backend.set_configuration(value)).await?;

        // Nothing is swapped until the new descriptor has been read
        let config = match self.backend.active_config_descriptor() {
            Ok(config) => Some(config),
            Err(DeviceError::NotFound) => None,
            Err(e) => {
                warn!(
                    "Failed to read configuration {} of {}: {}",
                    value,
                    self.label(),
                    e
                );
                return Err(e.into());
            }
        };
        let interfaces = self.interfaces_for(config.as_ref());
        if let Some(previous) = self.interfaces.replace(interfaces) {
            for interface in &previous {
                interface.invalidate();
            }
        }
        self.config_descriptor = OnceLock::from(config);

        info!("Device {} set to configuration {}", self.label(), value);
        Ok(())
    }

    /// Interfaces of the active configuration
    pub fn interfaces(&self) -> Result<&[Interface], UsbError> {
        self.interfaces
            .as_deref()
            .ok_or_else(|| UsbError::invalid_state("device has no interface list; open it first"))
    }

    /// Interface with `bInterfaceNumber == number`
    pub fn interface(&self, number: u8) -> Result<Option<Interface>, UsbError> {
        Ok(self
            .interfaces()?
            .iter()
            .find(|interface| interface.interface_number() == number)
            .cloned())
    }

    /// Submit a control transfer on endpoint 0
    ///
    /// `data` must be a length for IN requests and bytes for OUT requests;
    /// a mismatch fails with [`UsbError::InvalidArgument`] before anything is
    /// submitted. The returned future yields the received payload for IN
    /// requests and `None` for OUT requests.
    pub fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: impl Into<ControlData>,
    ) -> Result<ControlTransfer, UsbError> {
        let data = data.into();
        let direction = data.direction();
        let buffer = encode_control_transfer(request_type, request, value, index, data)?;
        self.ensure_open()?;

        let transfer = Transfer::new(
            self.backend.clone(),
            0,
            TransferKind::Control,
            self.timeout,
            None,
        );
        let inner = transfer.submit(buffer)?;
        Ok(ControlTransfer { inner, direction })
    }

    /// Read string descriptor `index` in US English
    ///
    /// An empty reply yields `None`.
    pub async fn get_string_descriptor(&self, index: u8) -> Result<Option<String>, UsbError> {
        let reply = self
            .control_transfer(
                ENDPOINT_IN,
                request::GET_DESCRIPTOR,
                (u16::from(descriptor_type::STRING) << 8) | u16::from(index),
                LANGUAGE_ID_EN_US,
                MAX_STRING_DESCRIPTOR_LENGTH,
            )?
            .await?;
        Ok(reply.and_then(|data| decode_string_descriptor(&data)))
    }

    /// Binary Object Store descriptor
    ///
    /// `None` when the device predates USB 2.01 or stalls the request. The
    /// result is fetched once; concurrent callers share the fetch. Errors are
    /// not cached.
    pub async fn get_bos_descriptor(&self) -> Result<Option<Arc<BosDescriptor>>, UsbError> {
        if let Some(cached) = self.bos.get() {
            return Ok(cached.clone());
        }

        if self.descriptor.usb_version < BOS_MIN_USB_VERSION {
            debug!(
                "Device {} reports USB {:#06x}, no BOS descriptor",
                self.label(),
                self.descriptor.usb_version
            );
            return Ok(None);
        }

        let bos = self.bos.get_or_try_init(|| self.fetch_bos()).await?;
        Ok(bos.clone())
    }

    async fn fetch_bos(&self) -> Result<Option<Arc<BosDescriptor>>, UsbError> {
        let Some(header) = self.read_bos(BOS_HEADER_SIZE as u16).await? else {
            return Ok(None);
        };
        let header = decode_bos_header(&header)?;
        debug!(
            "BOS header of {}: {} bytes, {} capabilities",
            self.label(),
            header.total_length,
            header.num_device_caps
        );

        let Some(full) = self.read_bos(header.total_length).await? else {
            return Ok(None);
        };
        let bos = decode_bos_descriptor(full)?;
        if !bos.count_matches() {
            warn!(
                "Device {} declares {} capabilities but {} were parsed",
                self.label(),
                bos.num_device_caps,
                bos.capabilities.len()
            );
        }

        Ok(Some(Arc::new(bos)))
    }

    /// One GET_DESCRIPTOR(BOS) request; stalls and empty replies are `None`
    async fn read_bos(&self, length: u16) -> Result<Option<Bytes>, UsbError> {
        let reply = self
            .control_transfer(
                ENDPOINT_IN,
                request::GET_DESCRIPTOR,
                u16::from(descriptor_type::BOS) << 8,
                0,
                length,
            )?
            .await;

        match reply {
            Ok(Some(data)) if !data.is_empty() => Ok(Some(data)),
            Ok(_) => {
                debug!("Device {} returned an empty BOS descriptor", self.label());
                Ok(None)
            }
            Err(e) if e.is_stall() => {
                debug!("Device {} does not support BOS", self.label());
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Capability records of the BOS descriptor, in descriptor order
    pub async fn get_capabilities(&self) -> Result<Vec<Capability>, UsbError> {
        let Some(bos) = self.get_bos_descriptor().await? else {
            return Ok(Vec::new());
        };
        Ok((0..bos.capabilities.len())
            .map(|index| Capability::new(bos.clone(), index))
            .collect())
    }

    /// Reset the device
    pub async fn reset(&self) -> Result<(), UsbError> {
        self.ensure_open()?;
        let backend = self.backend.clone();
        run_blocking(move || backend.reset()).await?;
        info!("Reset device {}", self.label());
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), UsbError> {
        if self.open {
            Ok(())
        } else {
            Err(UsbError::invalid_state("device is not open"))
        }
    }

    fn build_interfaces(&mut self) -> Result<(), UsbError> {
        let interfaces = self.interfaces_for(self.config_descriptor()?);
        self.interfaces = Some(interfaces);
        Ok(())
    }

    fn interfaces_for(&self, config: Option<&ConfigDescriptor>) -> Vec<Interface> {
        let interfaces: Vec<Interface> = config
            .map(|config| {
                config
                    .interfaces
                    .iter()
                    .enumerate()
                    .map(|(index, alts)| {
                        Interface::new(self.backend.clone(), index, alts.clone())
                    })
                    .collect()
            })
            .unwrap_or_default();
        debug!(
            "Device {} has {} interfaces",
            self.label(),
            interfaces.len()
        );
        interfaces
    }

    fn label(&self) -> String {
        format!(
            "{:03}:{:03} ({:04x}:{:04x})",
            self.bus_number(),
            self.device_address(),
            self.descriptor.vendor_id,
            self.descriptor.product_id
        )
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("bus_number", &self.bus_number())
            .field("device_address", &self.device_address())
            .field("vendor_id", &format_args!("{:#06x}", self.descriptor.vendor_id))
            .field("product_id", &format_args!("{:#06x}", self.descriptor.product_id))
            .field("open", &self.open)
            .finish()
    }
}

/// Pending control transfer returned by [`Device::control_transfer`]
#[derive(Debug)]
#[must_use = "dropping the future does not cancel the transfer"]
pub struct ControlTransfer {
    inner: TransferFuture,
    direction: Direction,
}

impl Future for ControlTransfer {
    type Output = Result<Option<Bytes>, UsbError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let direction = self.direction;
        let completion = ready!(Pin::new(&mut self.inner).poll(cx));
        completion.result.clone()?;

        Poll::Ready(Ok(match direction {
            Direction::In => Some(completion.data_at(CONTROL_SETUP_SIZE)),
            Direction::Out => None,
        }))
    }
}
