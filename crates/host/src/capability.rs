//! Device capability views

use bytes::Bytes;
use common::UsbError;
use protocol::{BosDescriptor, CapabilityDescriptor, CapabilityType, DeviceCapability};
use std::fmt;
use std::sync::Arc;

/// One capability record of a device's BOS descriptor
///
/// Shares the cached descriptor and resolves its fields by index; the payload
/// is a view into the BOS buffer.
#[derive(Clone)]
pub struct Capability {
    bos: Arc<BosDescriptor>,
    index: usize,
}

impl Capability {
    pub(crate) fn new(bos: Arc<BosDescriptor>, index: usize) -> Self {
        debug_assert!(index < bos.capabilities.len());
        Self { bos, index }
    }

    /// Position in the BOS descriptor
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn descriptor(&self) -> &CapabilityDescriptor {
        &self.bos.capabilities[self.index]
    }

    pub fn capability_type(&self) -> CapabilityType {
        CapabilityType::from(self.descriptor().capability_type)
    }

    /// Record bytes after the 3-byte capability header
    pub fn data(&self) -> &Bytes {
        &self.descriptor().data
    }

    /// Interpret the record by its type
    pub fn decode(&self) -> Result<DeviceCapability, UsbError> {
        Ok(DeviceCapability::decode(self.descriptor())?)
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("index", &self.index)
            .field("type", &self.capability_type())
            .field("length", &self.descriptor().length)
            .finish()
    }
}
