//! Synchronous transfer execution
//!
//! Runs one [`SubmitRequest`] against a libusb handle and maps rusb errors to
//! [`DeviceError`]. Called from the endpoint worker threads only.

use super::read_lock;
use crate::backend::SubmitRequest;
use common::DeviceError;
use protocol::{CONTROL_SETUP_SIZE, ControlSetup, Direction, TransferKind};
use rusb::{Context, DeviceHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Handle of an open device, `None` once it is closed
pub(crate) type SharedHandle = Arc<RwLock<Option<DeviceHandle<Context>>>>;

/// Execute `request` and return the number of data-stage bytes transferred
///
/// IN bulk and interrupt reads are split into `slice`-long waits; `cancelled`
/// is checked between them.
pub(crate) fn execute_transfer(
    handle: &SharedHandle,
    request: &mut SubmitRequest,
    slice: Duration,
    cancelled: &AtomicBool,
) -> Result<usize, DeviceError> {
    match request.kind {
        TransferKind::Control => execute_control_transfer(handle, request),
        TransferKind::Bulk | TransferKind::Interrupt => {
            if Direction::from_bits(request.endpoint) == Direction::In {
                read_sliced(handle, request, slice, cancelled)
            } else {
                write_data(handle, request)
            }
        }
        TransferKind::Isochronous => Err(DeviceError::NotSupported),
    }
}

fn execute_control_transfer(
    handle: &SharedHandle,
    request: &mut SubmitRequest,
) -> Result<usize, DeviceError> {
    let setup = ControlSetup::decode(&request.buffer).map_err(|_| DeviceError::InvalidParam)?;
    trace!(
        "Control transfer: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}, length={}",
        setup.request_type, setup.request, setup.value, setup.index, setup.length
    );

    let guard = read_lock(handle);
    let device = guard.as_ref().ok_or(DeviceError::NoDevice)?;
    let data = &mut request.buffer[CONTROL_SETUP_SIZE..];

    let result = match setup.direction() {
        Direction::In => {
            let end = data.len().min(usize::from(setup.length));
            device.read_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                &mut data[..end],
                request.timeout,
            )
        }
        Direction::Out => device.write_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            data,
            request.timeout,
        ),
    };

    result.map_err(map_rusb_error)
}

fn read_sliced(
    handle: &SharedHandle,
    request: &mut SubmitRequest,
    slice: Duration,
    cancelled: &AtomicBool,
) -> Result<usize, DeviceError> {
    let deadline = (!request.timeout.is_zero()).then(|| Instant::now() + request.timeout);

    loop {
        if cancelled.load(Ordering::SeqCst) {
            return Err(DeviceError::Cancelled);
        }

        let wait = match deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(DeviceError::Timeout);
                }
                left.min(slice)
            }
            None => slice,
        };

        let result = {
            let guard = read_lock(handle);
            let device = guard.as_ref().ok_or(DeviceError::NoDevice)?;
            match request.kind {
                TransferKind::Interrupt => {
                    device.read_interrupt(request.endpoint, &mut request.buffer, wait)
                }
                _ => device.read_bulk(request.endpoint, &mut request.buffer, wait),
            }
        };

        match result {
            Ok(len) => return Ok(len),
            Err(rusb::Error::Timeout) => continue,
            Err(e) => {
                debug!("Read on endpoint {:#04x} failed: {}", request.endpoint, e);
                return Err(map_rusb_error(e));
            }
        }
    }
}

fn write_data(handle: &SharedHandle, request: &SubmitRequest) -> Result<usize, DeviceError> {
    let guard = read_lock(handle);
    let device = guard.as_ref().ok_or(DeviceError::NoDevice)?;

    let result = match request.kind {
        TransferKind::Interrupt => {
            device.write_interrupt(request.endpoint, &request.buffer, request.timeout)
        }
        _ => device.write_bulk(request.endpoint, &request.buffer, request.timeout),
    };

    result.map_err(map_rusb_error)
}

/// Map rusb::Error to DeviceError
pub fn map_rusb_error(err: rusb::Error) -> DeviceError {
    match err {
        rusb::Error::Timeout => DeviceError::Timeout,
        rusb::Error::Pipe => DeviceError::Stall,
        rusb::Error::NoDevice => DeviceError::NoDevice,
        rusb::Error::NotFound => DeviceError::NotFound,
        rusb::Error::Busy => DeviceError::Busy,
        rusb::Error::Overflow => DeviceError::Overflow,
        rusb::Error::Io => DeviceError::Io,
        rusb::Error::InvalidParam => DeviceError::InvalidParam,
        rusb::Error::Access => DeviceError::Access,
        rusb::Error::NotSupported => DeviceError::NotSupported,
        rusb::Error::Interrupted => DeviceError::Other(-10),
        rusb::Error::NoMem => DeviceError::Other(-11),
        _ => DeviceError::Other(-99),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), DeviceError::Timeout);
        assert_eq!(map_rusb_error(rusb::Error::Pipe), DeviceError::Stall);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), DeviceError::NoDevice);
        assert_eq!(map_rusb_error(rusb::Error::NotFound), DeviceError::NotFound);
        assert_eq!(
            map_rusb_error(rusb::Error::NotSupported),
            DeviceError::NotSupported
        );
        assert_eq!(map_rusb_error(rusb::Error::Other), DeviceError::Other(-99));
    }

    #[test]
    fn test_mapped_codes_match_libusb() {
        assert_eq!(map_rusb_error(rusb::Error::Access).code(), -3);
        assert_eq!(map_rusb_error(rusb::Error::Busy).code(), -6);
        assert_eq!(map_rusb_error(rusb::Error::Interrupted).code(), -10);
    }
}
