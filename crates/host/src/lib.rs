//! USB host access
//!
//! Enumerate devices, open them, walk their configuration, claim interfaces and
//! move data over control, bulk and interrupt endpoints. Device arrival and
//! removal are delivered through [`Usb::subscribe`].
//!
//! The crate does not execute transfers itself. Every [`Device`] talks to a
//! [`DeviceBackend`], the transfer engine that accepts a buffer and later reports
//! how it went. [`engine`] provides one over libusb (via `rusb`) and
//! [`testing`] an in-memory one for tests.
//!
//! # Example
//!
//! ```no_run
//! use host::{Usb, UsbOptions};
//!
//! # async fn run() -> Result<(), common::UsbError> {
//! let usb = Usb::with_libusb(UsbOptions::default())?;
//! if let Some(mut device) = usb.find_by_ids(0x1234, 0x5678)? {
//!     device.open(true)?;
//!     let index = device.device_descriptor().product_index;
//!     println!("{:?}", device.get_string_descriptor(index).await?);
//!     device.close();
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod capability;
pub mod context;
pub mod device;
pub mod endpoint;
pub mod engine;
pub mod hotplug;
pub mod interface;
pub mod testing;
pub mod transfer;

pub use backend::{DeviceBackend, HostBackend, Rejected, SubmissionId, SubmitRequest};
pub use capability::Capability;
pub use context::Usb;
pub use device::{ControlTransfer, Device};
pub use endpoint::{Endpoint, EndpointCore, EndpointPoll, InEndpoint, OutEndpoint, PollOptions};
pub use engine::UsbOptions;
pub use hotplug::{EventKind, HotplugSink, Subscription, UsbEvent};
pub use interface::Interface;
pub use transfer::{Completion, Transfer, TransferFuture, TransferState};

pub use common::{DeviceError, UsbError};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run a blocking engine call on the runtime's blocking pool
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T, UsbError>
where
    F: FnOnce() -> Result<T, DeviceError> + Send + 'static,
    T: Send + 'static,
{
    let runtime = tokio::runtime::Handle::try_current()
        .map_err(|_| UsbError::invalid_state("no tokio runtime available"))?;

    match runtime.spawn_blocking(f).await {
        Ok(result) => result.map_err(UsbError::from),
        Err(e) => {
            tracing::error!("Blocking engine call failed: {}", e);
            Err(UsbError::Device(DeviceError::Other(-99)))
        }
    }
}
