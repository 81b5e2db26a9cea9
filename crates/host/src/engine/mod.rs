//! libusb-backed transfer engine
//!
//! Transfers run synchronously on dedicated threads so the tokio runtime is
//! never blocked by libusb:
//! - every endpoint of an open device gets its own worker thread, so a read
//!   that waits for data on one endpoint does not hold up control requests
//! - IN reads are issued in short slices, between which cancellation and the
//!   overall timeout are checked
//! - hotplug notifications are pumped by an event thread that only runs
//!   while delivery is enabled

pub mod device;
pub mod manager;
pub mod transfers;
pub mod worker;

pub use device::RusbDevice;
pub use manager::RusbHost;
pub use transfers::map_rusb_error;

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// Tuning knobs for the libusb engine
#[derive(Debug, Clone)]
pub struct UsbOptions {
    /// Transfers that may be queued per endpoint before submissions are refused
    pub queue_depth: usize,
    /// How long the hotplug thread waits for libusb events per iteration
    pub hotplug_poll_interval: Duration,
    /// Length of one IN read slice
    pub poll_slice: Duration,
}

impl Default for UsbOptions {
    fn default() -> Self {
        Self {
            queue_depth: 256,
            hotplug_poll_interval: Duration::from_millis(100),
            poll_slice: Duration::from_millis(100),
        }
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
