//! Endpoints of a claimed interface
//!
//! Endpoints are created by their [`Interface`](crate::Interface) and are only
//! usable while it stays claimed with the same alternate setting. After the
//! interface is released, reconfigured or switched to another setting, every
//! submission through an old endpoint handle fails with
//! [`UsbError::InvalidState`].

use crate::backend::{DeviceBackend, SubmissionId};
use crate::transfer::Transfer;
use crate::{lock, run_blocking};
use bytes::{Bytes, BytesMut};
use common::UsbError;
use protocol::{Direction, EndpointDescriptor, TransferKind};
use std::collections::HashSet;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Capacity of the channel between poll tasks and [`EndpointPoll`]
const POLL_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
struct GateState {
    usable: bool,
    in_flight: HashSet<SubmissionId>,
}

/// Usability flag and in-flight set shared by an endpoint and its transfers
#[derive(Debug)]
pub(crate) struct EndpointShared {
    state: Mutex<GateState>,
    drained: Notify,
}

impl EndpointShared {
    fn new(usable: bool) -> Self {
        Self {
            state: Mutex::new(GateState {
                usable,
                in_flight: HashSet::new(),
            }),
            drained: Notify::new(),
        }
    }

    /// Track a new submission if the endpoint is usable
    pub(crate) fn begin(&self, id: SubmissionId) -> Result<(), UsbError> {
        let mut state = lock(&self.state);
        if !state.usable {
            return Err(UsbError::invalid_state(
                "endpoint is not usable: interface released, reconfigured or not claimed",
            ));
        }
        state.in_flight.insert(id);
        Ok(())
    }

    pub(crate) fn finish(&self, id: SubmissionId) {
        let mut state = lock(&self.state);
        if state.in_flight.remove(&id) && state.in_flight.is_empty() {
            self.drained.notify_waiters();
        }
    }

    pub(crate) fn set_usable(&self, usable: bool) {
        lock(&self.state).usable = usable;
    }

    fn is_usable(&self) -> bool {
        lock(&self.state).usable
    }

    pub(crate) fn in_flight(&self) -> Vec<SubmissionId> {
        lock(&self.state).in_flight.iter().copied().collect()
    }

    fn pending(&self) -> usize {
        lock(&self.state).in_flight.len()
    }

    pub(crate) async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if lock(&self.state).in_flight.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// State and operations common to IN and OUT endpoints
pub struct EndpointCore {
    backend: Arc<dyn DeviceBackend>,
    descriptor: EndpointDescriptor,
    direction: Direction,
    kind: TransferKind,
    timeout_ms: AtomicU64,
    shared: Arc<EndpointShared>,
    poll: Mutex<Option<Weak<PollShared>>>,
}

impl EndpointCore {
    fn new(backend: Arc<dyn DeviceBackend>, descriptor: EndpointDescriptor, usable: bool) -> Self {
        Self {
            backend,
            direction: descriptor.direction(),
            kind: descriptor.transfer_kind(),
            descriptor,
            timeout_ms: AtomicU64::new(0),
            shared: Arc::new(EndpointShared::new(usable)),
            poll: Mutex::new(None),
        }
    }

    /// Endpoint address, direction in the high bit
    pub fn address(&self) -> u8 {
        self.descriptor.address
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn transfer_kind(&self) -> TransferKind {
        self.kind
    }

    pub fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    pub fn max_packet_size(&self) -> u16 {
        self.descriptor.max_packet_size
    }

    /// Timeout used by the convenience transfers; zero means none
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Whether the owning interface is claimed with this endpoint's setting
    pub fn is_usable(&self) -> bool {
        self.shared.is_usable()
    }

    /// Submissions on this endpoint that have not completed yet
    pub fn pending_transfers(&self) -> usize {
        self.shared.pending()
    }

    /// Create a transfer on this endpoint
    pub fn make_transfer(&self, timeout: Duration) -> Transfer {
        Transfer::new(
            self.backend.clone(),
            self.address(),
            self.kind,
            timeout,
            Some(self.shared.clone()),
        )
    }

    /// Clear a halt/stall condition
    ///
    /// Fails with [`UsbError::InvalidState`] while transfers are pending.
    pub async fn clear_halt(&self) -> Result<(), UsbError> {
        if self.pending_transfers() > 0 {
            return Err(UsbError::invalid_state(
                "cannot clear halt while transfers are pending",
            ));
        }
        let backend = self.backend.clone();
        let address = self.address();
        run_blocking(move || backend.clear_halt(address)).await?;
        debug!("Cleared halt on endpoint {:#04x}", address);
        Ok(())
    }

    pub(crate) fn set_usable(&self, usable: bool) {
        self.shared.set_usable(usable);
    }

    pub(crate) fn shared(&self) -> &Arc<EndpointShared> {
        &self.shared
    }

    /// Ask the engine to cancel every in-flight submission
    pub(crate) fn cancel_in_flight(&self) -> usize {
        self.stop_poll();
        self.shared
            .in_flight()
            .into_iter()
            .filter(|id| self.backend.cancel(*id))
            .count()
    }

    pub(crate) fn stop_poll(&self) {
        let poll = lock(&self.poll).as_ref().and_then(Weak::upgrade);
        if let Some(poll) = poll {
            poll.stop();
        }
    }
}

impl fmt::Debug for EndpointCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &format_args!("{:#04x}", self.address()))
            .field("direction", &self.direction)
            .field("kind", &self.kind)
            .field("usable", &self.is_usable())
            .finish()
    }
}

/// Device-to-host endpoint
#[derive(Clone, Debug)]
pub struct InEndpoint {
    core: Arc<EndpointCore>,
}

/// Host-to-device endpoint
#[derive(Clone, Debug)]
pub struct OutEndpoint {
    core: Arc<EndpointCore>,
}

/// An endpoint of either direction
#[derive(Clone, Debug)]
pub enum Endpoint {
    In(InEndpoint),
    Out(OutEndpoint),
}

impl Endpoint {
    pub(crate) fn new(
        backend: Arc<dyn DeviceBackend>,
        descriptor: EndpointDescriptor,
        usable: bool,
    ) -> Self {
        let core = Arc::new(EndpointCore::new(backend, descriptor, usable));
        match core.direction {
            Direction::In => Endpoint::In(InEndpoint { core }),
            Direction::Out => Endpoint::Out(OutEndpoint { core }),
        }
    }

    pub fn as_in(&self) -> Option<&InEndpoint> {
        match self {
            Endpoint::In(ep) => Some(ep),
            Endpoint::Out(_) => None,
        }
    }

    pub fn as_out(&self) -> Option<&OutEndpoint> {
        match self {
            Endpoint::Out(ep) => Some(ep),
            Endpoint::In(_) => None,
        }
    }
}

impl Deref for Endpoint {
    type Target = EndpointCore;

    fn deref(&self) -> &EndpointCore {
        match self {
            Endpoint::In(ep) => &ep.core,
            Endpoint::Out(ep) => &ep.core,
        }
    }
}

impl Deref for InEndpoint {
    type Target = EndpointCore;

    fn deref(&self) -> &EndpointCore {
        &self.core
    }
}

impl Deref for OutEndpoint {
    type Target = EndpointCore;

    fn deref(&self) -> &EndpointCore {
        &self.core
    }
}

impl InEndpoint {
    /// Read up to `length` bytes
    ///
    /// Returns the received bytes, trimmed to the length actually transferred.
    pub async fn transfer(&self, length: usize) -> Result<Bytes, UsbError> {
        let transfer = self.make_transfer(self.timeout());
        let completion = transfer.submit(BytesMut::zeroed(length))?.await;
        completion.into_data()
    }

    /// Keep `options.transfers` reads in flight, yielding each chunk received
    ///
    /// Fails with [`UsbError::InvalidState`] when a poll is already running on
    /// this endpoint or no tokio runtime is available.
    pub fn start_poll(&self, options: PollOptions) -> Result<EndpointPoll, UsbError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| UsbError::invalid_state("no tokio runtime available"))?;

        if !self.is_usable() {
            return Err(UsbError::invalid_state(
                "endpoint is not usable: interface released, reconfigured or not claimed",
            ));
        }

        let mut slot = lock(&self.core.poll);
        let running = slot
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|poll| poll.active.load(Ordering::SeqCst));
        if running {
            return Err(UsbError::invalid_state("endpoint is already polling"));
        }

        let count = options.transfers.max(1);
        let size = options
            .transfer_size
            .unwrap_or(self.max_packet_size() as usize);
        let transfers: Vec<Transfer> = (0..count)
            .map(|_| self.make_transfer(self.timeout()))
            .collect();
        let shared = Arc::new(PollShared {
            active: AtomicBool::new(true),
            remaining: AtomicUsize::new(count),
            transfers,
        });
        *slot = Some(Arc::downgrade(&shared));
        drop(slot);

        let (tx, rx) = async_channel::bounded(POLL_CHANNEL_CAPACITY);
        for index in 0..count {
            runtime.spawn(drive_poll(shared.clone(), index, size, tx.clone()));
        }

        info!(
            "Started polling endpoint {:#04x} ({} transfers of {} bytes)",
            self.address(),
            count,
            size
        );

        Ok(EndpointPoll { rx, shared })
    }
}

impl OutEndpoint {
    /// Write `data`, returning the number of bytes sent
    pub async fn transfer(&self, data: impl Into<Bytes>) -> Result<usize, UsbError> {
        let data: Bytes = data.into();
        let transfer = self.make_transfer(self.timeout());
        let completion = transfer.submit(BytesMut::from(&data[..]))?.await;
        completion.result?;
        Ok(completion.actual_length)
    }

    /// Write `data`, followed by a zero-length packet when its length is a
    /// non-zero multiple of `wMaxPacketSize`
    pub async fn transfer_with_zlp(&self, data: impl Into<Bytes>) -> Result<usize, UsbError> {
        let data: Bytes = data.into();
        let max_packet = self.max_packet_size() as usize;
        let needs_zlp = max_packet > 0 && !data.is_empty() && data.len() % max_packet == 0;

        let sent = self.transfer(data).await?;
        if needs_zlp {
            self.transfer(Bytes::new()).await?;
        }
        Ok(sent)
    }
}

/// Options for [`InEndpoint::start_poll`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    /// Number of transfers kept in flight
    pub transfers: usize,
    /// Bytes per transfer; `None` uses `wMaxPacketSize`
    pub transfer_size: Option<usize>,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            transfers: 3,
            transfer_size: None,
        }
    }
}

struct PollShared {
    active: AtomicBool,
    remaining: AtomicUsize,
    transfers: Vec<Transfer>,
}

impl PollShared {
    fn stop(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            let cancelled = self.transfers.iter().filter(|t| t.cancel()).count();
            debug!("Stopping poll, cancelled {} transfers", cancelled);
        }
    }
}

async fn drive_poll(
    shared: Arc<PollShared>,
    index: usize,
    size: usize,
    tx: async_channel::Sender<Result<Bytes, UsbError>>,
) {
    let transfer = &shared.transfers[index];

    while shared.active.load(Ordering::SeqCst) {
        let future = match transfer.submit(BytesMut::zeroed(size)) {
            Ok(future) => future,
            Err(e) => {
                if shared.active.load(Ordering::SeqCst) {
                    warn!("Poll resubmission failed: {}", e);
                    shared.stop();
                    let _ = tx.send(Err(e)).await;
                }
                break;
            }
        };

        // stop() may have run between the loop check and the submission
        if !shared.active.load(Ordering::SeqCst) {
            transfer.cancel();
        }

        let completion = future.await;
        let data = completion.data_at(0);
        match completion.result {
            Ok(()) => {
                if tx.send(Ok(data)).await.is_err() {
                    shared.stop();
                    break;
                }
            }
            Err(ref e) if e.is_cancelled() => break,
            Err(e) => {
                if shared.active.load(Ordering::SeqCst) {
                    warn!("Poll transfer failed: {}", e);
                    shared.stop();
                    let _ = tx.send(Err(e)).await;
                }
                break;
            }
        }
    }

    if shared.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
        debug!(
            "Poll on endpoint {:#04x} ended",
            transfer.endpoint()
        );
    }
}

/// A running poll started by [`InEndpoint::start_poll`]
///
/// Dropping it stops the poll.
pub struct EndpointPoll {
    rx: async_channel::Receiver<Result<Bytes, UsbError>>,
    shared: Arc<PollShared>,
}

impl EndpointPoll {
    /// Next chunk of data or error
    ///
    /// Returns `None` once the poll has stopped and every pooled transfer has
    /// reported.
    pub async fn next(&self) -> Option<Result<Bytes, UsbError>> {
        self.rx.recv().await.ok()
    }

    /// Cancel every pooled transfer
    pub fn stop(&self) {
        self.shared.stop();
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Pooled transfers still running
    pub fn remaining(&self) -> usize {
        self.shared.remaining.load(Ordering::SeqCst)
    }
}

impl Drop for EndpointPoll {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

impl fmt::Debug for EndpointPoll {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointPoll")
            .field("active", &self.is_active())
            .field("remaining", &self.remaining())
            .finish()
    }
}
