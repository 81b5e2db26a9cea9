//! Common error types
//!
//! [`UsbError`] is the error every host library operation returns. Failures
//! reported by the transfer engine are carried as a [`DeviceError`] inside it.
//! [`Error`] is the application-level error used by logging setup and the
//! probe binary.

use protocol::ProtocolError;
use thiserror::Error;

/// Failure reported by the transfer engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum DeviceError {
    #[error("endpoint stalled")]
    Stall,

    #[error("operation timed out")]
    Timeout,

    #[error("device is no longer present")]
    NoDevice,

    #[error("input/output error")]
    Io,

    #[error("access denied")]
    Access,

    #[error("entity not found")]
    NotFound,

    #[error("resource busy")]
    Busy,

    #[error("overflow")]
    Overflow,

    #[error("transfer cancelled")]
    Cancelled,

    #[error("invalid parameter")]
    InvalidParam,

    #[error("operation not supported")]
    NotSupported,

    #[error("engine error {0}")]
    Other(i32),
}

impl DeviceError {
    /// libusb numeric code for this failure
    ///
    /// Conditions that libusb reports as a transfer status (stall, timeout,
    /// cancellation, overflow, no-device) use the `LIBUSB_TRANSFER_*` value;
    /// the rest use the negative `LIBUSB_ERROR_*` value.
    pub fn code(&self) -> i32 {
        match self {
            DeviceError::Timeout => 2,
            DeviceError::Cancelled => 3,
            DeviceError::Stall => 4,
            DeviceError::NoDevice => 5,
            DeviceError::Overflow => 6,
            DeviceError::Io => -1,
            DeviceError::InvalidParam => -2,
            DeviceError::Access => -3,
            DeviceError::NotFound => -5,
            DeviceError::Busy => -6,
            DeviceError::NotSupported => -12,
            DeviceError::Other(code) => *code,
        }
    }
}

/// Error returned by host library operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsbError {
    /// Caller supplied an argument that cannot be honored; raised before any I/O
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation attempted in a state that does not allow it
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Failure reported by the transfer engine
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// Descriptor bytes violate the expected layout
    #[error("malformed descriptor: {0}")]
    MalformedDescriptor(String),
}

impl UsbError {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        UsbError::InvalidState(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        UsbError::InvalidArgument(msg.into())
    }

    /// Engine failure carried by this error, if any
    pub fn device_error(&self) -> Option<DeviceError> {
        match self {
            UsbError::Device(err) => Some(*err),
            _ => None,
        }
    }

    /// Engine code carried by this error, if any
    pub fn device_code(&self) -> Option<i32> {
        self.device_error().map(|err| err.code())
    }

    pub fn is_stall(&self) -> bool {
        self.device_error() == Some(DeviceError::Stall)
    }

    pub fn is_not_found(&self) -> bool {
        self.device_error() == Some(DeviceError::NotFound)
    }

    pub fn is_cancelled(&self) -> bool {
        self.device_error() == Some(DeviceError::Cancelled)
    }
}

impl From<ProtocolError> for UsbError {
    fn from(err: ProtocolError) -> Self {
        if err.is_argument_error() {
            UsbError::InvalidArgument(err.to_string())
        } else {
            UsbError::MalformedDescriptor(err.to_string())
        }
    }
}

/// Application-level error
#[derive(Debug, Error)]
pub enum Error {
    #[error("USB error: {0}")]
    Usb(#[from] UsbError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
