//! Common utilities for the USB host workspace
//!
//! This crate provides the error taxonomy shared by the host library and the
//! probe binary, tracing subscriber setup, and helpers for tests that need
//! descriptor fixtures or bounded waits.

pub mod error;
pub mod logging;
pub mod test_utils;

pub use error::{DeviceError, Error, Result, UsbError};
pub use logging::setup_logging;
