//! Transfer engine interface
//!
//! A [`DeviceBackend`] is the per-device half of the engine: the handle
//! operations (open, configure, claim, ...) plus asynchronous transfer
//! submission. A [`HostBackend`] enumerates devices and delivers hotplug
//! notifications.
//!
//! Transfers are handed over as a [`SubmitRequest`]. The engine owns it until
//! it calls [`SubmitRequest::complete`], which must happen exactly once. A
//! request dropped without being completed reports
//! [`DeviceError::NoDevice`] to its waiter.

use crate::hotplug::HotplugSink;
use crate::transfer::Completer;
use bytes::BytesMut;
use common::DeviceError;
use protocol::{ConfigDescriptor, DeviceDescriptor, TransferKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Identifies one submission of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubmissionId(u64);

impl SubmissionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SubmissionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// A transfer handed to the engine
#[derive(Debug)]
pub struct SubmitRequest {
    pub id: SubmissionId,
    /// Endpoint address, 0 for the default control pipe
    pub endpoint: u8,
    pub kind: TransferKind,
    /// Zero means no timeout
    pub timeout: Duration,
    /// For control transfers the 8-byte setup packet followed by the data stage
    pub buffer: BytesMut,
    pub(crate) completer: Completer,
}

impl SubmitRequest {
    /// Report the outcome and hand the buffer back
    ///
    /// `actual_length` counts data-stage bytes; for control transfers it
    /// excludes the setup packet.
    pub fn complete(self, result: Result<(), DeviceError>, actual_length: usize) {
        let SubmitRequest {
            buffer, completer, ..
        } = self;
        completer.complete(result, buffer, actual_length);
    }
}

/// A submission the engine refused outright
///
/// No completion is reported for a rejected request.
#[derive(Debug)]
pub struct Rejected {
    pub error: DeviceError,
    pub request: SubmitRequest,
}

impl Rejected {
    pub fn new(error: DeviceError, request: SubmitRequest) -> Self {
        Self { error, request }
    }
}

/// Per-device half of the transfer engine
///
/// Blocking calls are issued from the runtime's blocking pool, so
/// implementations may perform synchronous I/O in them.
pub trait DeviceBackend: Send + Sync + 'static {
    fn bus_number(&self) -> u8;

    fn address(&self) -> u8;

    /// Port path from the root hub
    fn port_numbers(&self) -> Vec<u8>;

    fn device_descriptor(&self) -> DeviceDescriptor;

    fn open(&self) -> Result<(), DeviceError>;

    /// Release the OS handle; queued transfers complete as cancelled
    fn close(&self);

    /// [`DeviceError::NotFound`] when the device is unconfigured
    fn active_config_descriptor(&self) -> Result<ConfigDescriptor, DeviceError>;

    fn config_descriptors(&self) -> Result<Vec<ConfigDescriptor>, DeviceError>;

    fn parent(&self) -> Option<Arc<dyn DeviceBackend>>;

    fn set_configuration(&self, value: u8) -> Result<(), DeviceError>;

    fn claim_interface(&self, interface: u8) -> Result<(), DeviceError>;

    fn release_interface(&self, interface: u8) -> Result<(), DeviceError>;

    fn set_alternate_setting(&self, interface: u8, setting: u8) -> Result<(), DeviceError>;

    fn clear_halt(&self, endpoint: u8) -> Result<(), DeviceError>;

    fn kernel_driver_active(&self, interface: u8) -> Result<bool, DeviceError>;

    fn detach_kernel_driver(&self, interface: u8) -> Result<(), DeviceError>;

    fn attach_kernel_driver(&self, interface: u8) -> Result<(), DeviceError>;

    fn reset(&self) -> Result<(), DeviceError>;

    /// Queue a transfer
    ///
    /// Must not block on I/O. The completion may be reported from any thread,
    /// including the calling one before `submit` returns.
    fn submit(&self, request: SubmitRequest) -> Result<(), Rejected>;

    /// Request cancellation of a submission
    ///
    /// Returns `true` if the submission will complete with
    /// [`DeviceError::Cancelled`], `false` if it already completed or cannot be
    /// interrupted.
    fn cancel(&self, id: SubmissionId) -> bool;
}

/// Host-level half of the transfer engine
pub trait HostBackend: Send + Sync + 'static {
    /// Currently attached devices
    fn devices(&self) -> Result<Vec<Arc<dyn DeviceBackend>>, DeviceError>;

    /// Start delivering attach/detach notifications to `sink`
    ///
    /// Must not report events before returning.
    fn enable_hotplug(&self, sink: HotplugSink) -> Result<(), DeviceError>;

    fn disable_hotplug(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_ids_increase() {
        let a = SubmissionId::next();
        let b = SubmissionId::next();
        assert!(b > a);
        assert_ne!(a.value(), b.value());
    }
}
