//! In-memory transfer engine for tests
//!
//! [`MockDevice`] answers submissions inline from scripted replies and records
//! everything it was asked to do. [`MockHost`] lists mock devices and lets a
//! test drive hotplug notifications by hand.
//!
//! Replies are looked up per endpoint address (0 for control). Without a
//! scripted reply, OUT requests are acknowledged, control GET_DESCRIPTOR
//! requests for strings and the BOS are answered from the builder data, other
//! control IN requests stall, and bulk/interrupt IN requests are held until
//! they are cancelled, the device is closed or the test completes them with
//! [`MockDevice::complete_held`].

use crate::backend::{DeviceBackend, HostBackend, Rejected, SubmissionId, SubmitRequest};
use crate::hotplug::HotplugSink;
use crate::lock;
use common::DeviceError;
use common::test_utils::{
    create_mock_config_descriptor, create_mock_device_descriptor, create_mock_string_descriptor,
};
use protocol::{
    CONTROL_SETUP_SIZE, ConfigDescriptor, ControlSetup, DeviceDescriptor, Direction,
    TransferKind, descriptor_type, request,
};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Scripted outcome of one submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// Complete successfully with this IN payload
    Data(Vec<u8>),
    /// Complete successfully; OUT payloads count as fully sent
    Ack,
    Stall,
    Fail(DeviceError),
    /// Keep the request pending
    Hold,
}

/// Blocking operation whose outcome can be forced with
/// [`MockDevice::fail_operation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Open,
    SetConfiguration,
    ClaimInterface,
    ReleaseInterface,
    SetAlternateSetting,
    ClearHalt,
    KernelDriver,
    Reset,
    /// Configuration descriptor reads; does not require an open handle
    ConfigDescriptor,
}

#[derive(Debug, Default)]
struct MockState {
    open: bool,
    active_config: Option<u8>,
    claimed: BTreeSet<u8>,
    alt_settings: HashMap<u8, u8>,
    kernel_drivers: HashSet<u8>,
    replies: HashMap<u8, VecDeque<MockReply>>,
    held: Vec<SubmitRequest>,
    setups: Vec<ControlSetup>,
    submissions: usize,
    out_data: HashMap<u8, Vec<Vec<u8>>>,
    cleared_halts: Vec<u8>,
    resets: usize,
    config_reads: usize,
    reject: Option<DeviceError>,
    failures: HashMap<MockOp, DeviceError>,
}

/// Scripted device
pub struct MockDevice {
    descriptor: DeviceDescriptor,
    bus_number: u8,
    address: u8,
    ports: Vec<u8>,
    configs: Vec<ConfigDescriptor>,
    strings: HashMap<u8, Vec<u8>>,
    bos: Option<Vec<u8>>,
    parent: Option<Arc<MockDevice>>,
    state: Mutex<MockState>,
}

/// Builder for [`MockDevice`]
pub struct MockDeviceBuilder {
    descriptor: DeviceDescriptor,
    bus_number: u8,
    address: u8,
    ports: Vec<u8>,
    configs: Vec<ConfigDescriptor>,
    configured: bool,
    strings: HashMap<u8, Vec<u8>>,
    bos: Option<Vec<u8>>,
    parent: Option<Arc<MockDevice>>,
    kernel_drivers: HashSet<u8>,
}

impl MockDeviceBuilder {
    /// bcdUSB reported by the device descriptor
    pub fn usb_version(mut self, version: u16) -> Self {
        self.descriptor.usb_version = version;
        self
    }

    pub fn bus(mut self, bus_number: u8, address: u8) -> Self {
        self.bus_number = bus_number;
        self.address = address;
        self
    }

    pub fn ports(mut self, ports: Vec<u8>) -> Self {
        self.ports = ports;
        self
    }

    /// Add a configuration; the first one added is active
    ///
    /// Without any call the device has the single configuration from
    /// [`create_mock_config_descriptor`].
    pub fn config(mut self, config: ConfigDescriptor) -> Self {
        self.configs.push(config);
        self.descriptor.num_configurations = self.configs.len() as u8;
        self
    }

    /// Start with no active configuration
    pub fn unconfigured(mut self) -> Self {
        self.configured = false;
        self
    }

    /// String descriptor `index`, encoded as UTF-16LE
    pub fn string(self, index: u8, value: &str) -> Self {
        self.raw_string(index, create_mock_string_descriptor(value))
    }

    /// String descriptor `index` with exactly these bytes
    pub fn raw_string(mut self, index: u8, bytes: Vec<u8>) -> Self {
        self.strings.insert(index, bytes);
        self
    }

    /// Raw BOS descriptor served for GET_DESCRIPTOR(BOS)
    pub fn bos(mut self, bos: Vec<u8>) -> Self {
        self.bos = Some(bos);
        self
    }

    pub fn parent(mut self, parent: Arc<MockDevice>) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Interface with a kernel driver bound
    pub fn kernel_driver(mut self, interface: u8) -> Self {
        self.kernel_drivers.insert(interface);
        self
    }

    pub fn build(self) -> Arc<MockDevice> {
        let configs = if self.configs.is_empty() {
            vec![create_mock_config_descriptor(1)]
        } else {
            self.configs
        };
        let active_config = if self.configured {
            configs.first().map(|config| config.configuration_value)
        } else {
            None
        };

        Arc::new(MockDevice {
            descriptor: self.descriptor,
            bus_number: self.bus_number,
            address: self.address,
            ports: self.ports,
            configs,
            strings: self.strings,
            bos: self.bos,
            parent: self.parent,
            state: Mutex::new(MockState {
                active_config,
                kernel_drivers: self.kernel_drivers,
                ..MockState::default()
            }),
        })
    }
}

impl MockDevice {
    pub fn builder(vendor_id: u16, product_id: u16) -> MockDeviceBuilder {
        MockDeviceBuilder {
            descriptor: create_mock_device_descriptor(vendor_id, product_id, 0x0200),
            bus_number: 1,
            address: 1,
            ports: vec![1],
            configs: Vec::new(),
            configured: true,
            strings: HashMap::new(),
            bos: None,
            parent: None,
            kernel_drivers: HashSet::new(),
        }
    }

    /// Queue a reply for the next submission on `endpoint`
    pub fn push_reply(&self, endpoint: u8, reply: MockReply) {
        lock(&self.state)
            .replies
            .entry(endpoint)
            .or_default()
            .push_back(reply);
    }

    /// Queue a reply for the next control transfer
    pub fn push_control_reply(&self, reply: MockReply) {
        self.push_reply(0, reply);
    }

    /// Refuse every submission with `error` until called with `None`
    pub fn reject_submissions(&self, error: Option<DeviceError>) {
        lock(&self.state).reject = error;
    }

    /// Fail `op` with `error` until called with `None`
    pub fn fail_operation(&self, op: MockOp, error: Option<DeviceError>) {
        let mut state = lock(&self.state);
        match error {
            Some(error) => state.failures.insert(op, error),
            None => state.failures.remove(&op),
        };
    }

    /// Complete the oldest held request on `endpoint` with `data`
    ///
    /// Returns `false` when nothing is held there.
    pub fn complete_held(&self, endpoint: u8, data: &[u8]) -> bool {
        let request = {
            let mut state = lock(&self.state);
            let Some(position) = state.held.iter().position(|r| r.endpoint == endpoint) else {
                return false;
            };
            state.held.remove(position)
        };
        let (request, actual_length) = fill(request, data);
        request.complete(Ok(()), actual_length);
        true
    }

    pub fn held_count(&self) -> usize {
        lock(&self.state).held.len()
    }

    /// Setup packets of every control transfer accepted so far
    pub fn setups(&self) -> Vec<ControlSetup> {
        lock(&self.state).setups.clone()
    }

    pub fn control_count(&self) -> usize {
        lock(&self.state).setups.len()
    }

    /// Accepted submissions on any endpoint
    pub fn submission_count(&self) -> usize {
        lock(&self.state).submissions
    }

    /// Payloads sent to OUT endpoint `endpoint`, in order
    pub fn out_data(&self, endpoint: u8) -> Vec<Vec<u8>> {
        lock(&self.state)
            .out_data
            .get(&endpoint)
            .cloned()
            .unwrap_or_default()
    }

    pub fn claimed_interfaces(&self) -> Vec<u8> {
        lock(&self.state).claimed.iter().copied().collect()
    }

    /// Alternate setting last selected for `interface`
    pub fn alt_setting(&self, interface: u8) -> Option<u8> {
        lock(&self.state).alt_settings.get(&interface).copied()
    }

    pub fn cleared_halts(&self) -> Vec<u8> {
        lock(&self.state).cleared_halts.clone()
    }

    pub fn reset_count(&self) -> usize {
        lock(&self.state).resets
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    /// Configuration descriptor reads that reached the device
    pub fn config_reads(&self) -> usize {
        lock(&self.state).config_reads
    }

    pub fn active_configuration(&self) -> Option<u8> {
        lock(&self.state).active_config
    }

    fn check(&self, op: MockOp) -> Result<(), DeviceError> {
        let state = lock(&self.state);
        if let Some(error) = state.failures.get(&op) {
            return Err(*error);
        }
        if op != MockOp::Open && !state.open {
            return Err(DeviceError::NoDevice);
        }
        Ok(())
    }

    fn default_control_reply(&self, setup: &ControlSetup) -> MockReply {
        if setup.direction() == Direction::Out {
            return MockReply::Ack;
        }
        if setup.request != request::GET_DESCRIPTOR {
            return MockReply::Stall;
        }

        let index = (setup.value & 0xFF) as u8;
        let found = match (setup.value >> 8) as u8 {
            descriptor_type::STRING if index == 0 => Some(vec![0x04, 0x03, 0x09, 0x04]),
            descriptor_type::STRING => self.strings.get(&index).cloned(),
            descriptor_type::BOS => self.bos.clone(),
            _ => None,
        };
        found.map(MockReply::Data).unwrap_or(MockReply::Stall)
    }
}

/// Copy IN `data` into the request buffer, after the setup packet for control
fn fill(mut request: SubmitRequest, data: &[u8]) -> (SubmitRequest, usize) {
    let offset = if request.kind == TransferKind::Control {
        CONTROL_SETUP_SIZE
    } else {
        0
    };
    let room = request.buffer.len().saturating_sub(offset);
    let n = data.len().min(room);
    request.buffer[offset..offset + n].copy_from_slice(&data[..n]);
    (request, n)
}

impl DeviceBackend for MockDevice {
    fn bus_number(&self) -> u8 {
        self.bus_number
    }

    fn address(&self) -> u8 {
        self.address
    }

    fn port_numbers(&self) -> Vec<u8> {
        self.ports.clone()
    }

    fn device_descriptor(&self) -> DeviceDescriptor {
        self.descriptor.clone()
    }

    fn open(&self) -> Result<(), DeviceError> {
        self.check(MockOp::Open)?;
        lock(&self.state).open = true;
        Ok(())
    }

    fn close(&self) {
        let held = {
            let mut state = lock(&self.state);
            state.open = false;
            state.claimed.clear();
            std::mem::take(&mut state.held)
        };
        for request in held {
            request.complete(Err(DeviceError::Cancelled), 0);
        }
    }

    fn active_config_descriptor(&self) -> Result<ConfigDescriptor, DeviceError> {
        let active = {
            let mut state = lock(&self.state);
            state.config_reads += 1;
            if let Some(error) = state.failures.get(&MockOp::ConfigDescriptor) {
                return Err(*error);
            }
            state.active_config.ok_or(DeviceError::NotFound)?
        };
        self.configs
            .iter()
            .find(|config| config.configuration_value == active)
            .cloned()
            .ok_or(DeviceError::NotFound)
    }

    fn config_descriptors(&self) -> Result<Vec<ConfigDescriptor>, DeviceError> {
        let mut state = lock(&self.state);
        state.config_reads += 1;
        if let Some(error) = state.failures.get(&MockOp::ConfigDescriptor) {
            return Err(*error);
        }
        Ok(self.configs.clone())
    }

    fn parent(&self) -> Option<Arc<dyn DeviceBackend>> {
        self.parent
            .clone()
            .map(|parent| parent as Arc<dyn DeviceBackend>)
    }

    fn set_configuration(&self, value: u8) -> Result<(), DeviceError> {
        self.check(MockOp::SetConfiguration)?;
        if !self
            .configs
            .iter()
            .any(|config| config.configuration_value == value)
        {
            return Err(DeviceError::NotFound);
        }
        let mut state = lock(&self.state);
        state.active_config = Some(value);
        state.claimed.clear();
        state.alt_settings.clear();
        Ok(())
    }

    fn claim_interface(&self, interface: u8) -> Result<(), DeviceError> {
        self.check(MockOp::ClaimInterface)?;
        lock(&self.state).claimed.insert(interface);
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> Result<(), DeviceError> {
        self.check(MockOp::ReleaseInterface)?;
        let mut state = lock(&self.state);
        if !state.claimed.remove(&interface) {
            return Err(DeviceError::NotFound);
        }
        state.alt_settings.remove(&interface);
        Ok(())
    }

    fn set_alternate_setting(&self, interface: u8, setting: u8) -> Result<(), DeviceError> {
        self.check(MockOp::SetAlternateSetting)?;
        let mut state = lock(&self.state);
        if !state.claimed.contains(&interface) {
            return Err(DeviceError::NotFound);
        }
        state.alt_settings.insert(interface, setting);
        Ok(())
    }

    fn clear_halt(&self, endpoint: u8) -> Result<(), DeviceError> {
        self.check(MockOp::ClearHalt)?;
        lock(&self.state).cleared_halts.push(endpoint);
        Ok(())
    }

    fn kernel_driver_active(&self, interface: u8) -> Result<bool, DeviceError> {
        self.check(MockOp::KernelDriver)?;
        Ok(lock(&self.state).kernel_drivers.contains(&interface))
    }

    fn detach_kernel_driver(&self, interface: u8) -> Result<(), DeviceError> {
        self.check(MockOp::KernelDriver)?;
        if lock(&self.state).kernel_drivers.remove(&interface) {
            Ok(())
        } else {
            Err(DeviceError::NotFound)
        }
    }

    fn attach_kernel_driver(&self, interface: u8) -> Result<(), DeviceError> {
        self.check(MockOp::KernelDriver)?;
        if lock(&self.state).kernel_drivers.insert(interface) {
            Ok(())
        } else {
            Err(DeviceError::Busy)
        }
    }

    fn reset(&self) -> Result<(), DeviceError> {
        self.check(MockOp::Reset)?;
        lock(&self.state).resets += 1;
        Ok(())
    }

    fn submit(&self, request: SubmitRequest) -> Result<(), Rejected> {
        let mut state = lock(&self.state);
        if let Some(error) = state.reject {
            return Err(Rejected::new(error, request));
        }
        if !state.open {
            return Err(Rejected::new(DeviceError::NoDevice, request));
        }
        state.submissions += 1;

        let (direction, payload_offset, scripted) = if request.kind == TransferKind::Control {
            let setup = match ControlSetup::decode(&request.buffer) {
                Ok(setup) => setup,
                Err(_) => return Err(Rejected::new(DeviceError::InvalidParam, request)),
            };
            state.setups.push(setup);
            let scripted = state.replies.get_mut(&0).and_then(VecDeque::pop_front);
            (
                setup.direction(),
                CONTROL_SETUP_SIZE,
                Some(scripted.unwrap_or_else(|| self.default_control_reply(&setup))),
            )
        } else {
            let scripted = state
                .replies
                .get_mut(&request.endpoint)
                .and_then(VecDeque::pop_front);
            (Direction::from_bits(request.endpoint), 0, scripted)
        };

        let reply = match (scripted, direction) {
            (Some(reply), _) => reply,
            (None, Direction::Out) => MockReply::Ack,
            (None, Direction::In) => MockReply::Hold,
        };

        if reply == MockReply::Hold {
            state.held.push(request);
            return Ok(());
        }

        if direction == Direction::Out && matches!(reply, MockReply::Ack | MockReply::Data(_)) {
            let sent = request.buffer[payload_offset.min(request.buffer.len())..].to_vec();
            if request.kind != TransferKind::Control {
                state
                    .out_data
                    .entry(request.endpoint)
                    .or_default()
                    .push(sent.clone());
            }
            drop(state);
            request.complete(Ok(()), sent.len());
            return Ok(());
        }
        drop(state);

        match reply {
            MockReply::Data(data) => {
                let (request, actual_length) = fill(request, &data);
                request.complete(Ok(()), actual_length);
            }
            MockReply::Ack => request.complete(Ok(()), 0),
            MockReply::Stall => request.complete(Err(DeviceError::Stall), 0),
            MockReply::Fail(error) => request.complete(Err(error), 0),
            MockReply::Hold => {}
        }
        Ok(())
    }

    fn cancel(&self, id: SubmissionId) -> bool {
        let request = {
            let mut state = lock(&self.state);
            let Some(position) = state.held.iter().position(|r| r.id == id) else {
                return false;
            };
            state.held.remove(position)
        };
        request.complete(Err(DeviceError::Cancelled), 0);
        true
    }
}

impl fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockDevice")
            .field("bus_number", &self.bus_number)
            .field("address", &self.address)
            .field("vendor_id", &format_args!("{:#06x}", self.descriptor.vendor_id))
            .field("product_id", &format_args!("{:#06x}", self.descriptor.product_id))
            .finish()
    }
}

#[derive(Default)]
struct HostState {
    devices: Vec<Arc<MockDevice>>,
    sink: Option<HotplugSink>,
    enable_count: usize,
    disable_count: usize,
    fail_enable: Option<DeviceError>,
}

/// Scripted host with manual hotplug notifications
#[derive(Default)]
pub struct MockHost {
    state: Mutex<HostState>,
}

impl MockHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `device` part of the enumeration without an attach event
    pub fn add_device(&self, device: Arc<MockDevice>) {
        lock(&self.state).devices.push(device);
    }

    /// Plug `device` in; listeners are notified while hotplug is enabled
    pub fn attach(&self, device: Arc<MockDevice>) {
        let sink = {
            let mut state = lock(&self.state);
            state.devices.push(device.clone());
            state.sink.clone()
        };
        if let Some(sink) = sink {
            sink.device_arrived(device);
        }
    }

    /// Unplug `device`; listeners are notified while hotplug is enabled
    pub fn detach(&self, device: &Arc<MockDevice>) {
        let sink = {
            let mut state = lock(&self.state);
            state.devices.retain(|d| !Arc::ptr_eq(d, device));
            state.sink.clone()
        };
        if let Some(sink) = sink {
            sink.device_left(device.clone());
        }
    }

    pub fn emit_error(&self, message: &str) {
        let sink = lock(&self.state).sink.clone();
        if let Some(sink) = sink {
            sink.error(message);
        }
    }

    pub fn enable_count(&self) -> usize {
        lock(&self.state).enable_count
    }

    pub fn disable_count(&self) -> usize {
        lock(&self.state).disable_count
    }

    /// Whether a sink is currently installed
    pub fn hotplug_active(&self) -> bool {
        lock(&self.state).sink.is_some()
    }

    /// Fail enabling hotplug with `error` until called with `None`
    pub fn fail_enable(&self, error: Option<DeviceError>) {
        lock(&self.state).fail_enable = error;
    }
}

impl HostBackend for MockHost {
    fn devices(&self) -> Result<Vec<Arc<dyn DeviceBackend>>, DeviceError> {
        Ok(lock(&self.state)
            .devices
            .iter()
            .map(|device| device.clone() as Arc<dyn DeviceBackend>)
            .collect())
    }

    fn enable_hotplug(&self, sink: HotplugSink) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        if let Some(error) = state.fail_enable {
            return Err(error);
        }
        state.sink = Some(sink);
        state.enable_count += 1;
        Ok(())
    }

    fn disable_hotplug(&self) {
        let mut state = lock(&self.state);
        state.sink = None;
        state.disable_count += 1;
    }
}

impl fmt::Debug for MockHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("MockHost")
            .field("devices", &state.devices.len())
            .field("hotplug_active", &state.sink.is_some())
            .finish()
    }
}
