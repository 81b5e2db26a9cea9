//! Asynchronous transfers
//!
//! A [`Transfer`] is a reusable descriptor for I/O on one endpoint. Each call
//! to [`Transfer::submit`] hands a buffer to the engine and returns a
//! [`TransferFuture`] that resolves exactly once with a [`Completion`].
//!
//! ```text
//! Idle ──submit──▶ Submitted ──engine──▶ Completed | Cancelled | Error
//!                                  ▲                      │
//!                                  └──────── submit ──────┘
//! ```

use crate::backend::{DeviceBackend, SubmissionId, SubmitRequest};
use crate::endpoint::EndpointShared;
use crate::lock;
use bytes::{Bytes, BytesMut};
use common::{DeviceError, UsbError};
use protocol::TransferKind;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Lifecycle state of a [`Transfer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Submitted,
    Completed,
    Cancelled,
    Error,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Cancelled | TransferState::Error
        )
    }
}

#[derive(Debug)]
struct Slot {
    state: TransferState,
    submission: Option<SubmissionId>,
    cancel_requested: bool,
}

/// One asynchronous I/O operation on an endpoint
pub struct Transfer {
    backend: Arc<dyn DeviceBackend>,
    endpoint: u8,
    kind: TransferKind,
    timeout: Duration,
    gate: Option<Arc<EndpointShared>>,
    slot: Arc<Mutex<Slot>>,
}

impl Transfer {
    pub(crate) fn new(
        backend: Arc<dyn DeviceBackend>,
        endpoint: u8,
        kind: TransferKind,
        timeout: Duration,
        gate: Option<Arc<EndpointShared>>,
    ) -> Self {
        Self {
            backend,
            endpoint,
            kind,
            timeout,
            gate,
            slot: Arc::new(Mutex::new(Slot {
                state: TransferState::Idle,
                submission: None,
                cancel_requested: false,
            })),
        }
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn state(&self) -> TransferState {
        lock(&self.slot).state
    }

    /// Hand `buffer` to the engine
    ///
    /// Fails with [`UsbError::InvalidState`] while a previous submission is
    /// still in flight or when the endpoint is no longer usable, and with
    /// [`UsbError::Device`] when the engine refuses the submission. In both
    /// cases no completion is delivered.
    pub fn submit(&self, buffer: BytesMut) -> Result<TransferFuture, UsbError> {
        let id = SubmissionId::next();

        if let Some(gate) = &self.gate {
            gate.begin(id)?;
        }

        {
            let mut slot = lock(&self.slot);
            if slot.state == TransferState::Submitted {
                drop(slot);
                if let Some(gate) = &self.gate {
                    gate.finish(id);
                }
                return Err(UsbError::invalid_state("transfer is already submitted"));
            }
            slot.state = TransferState::Submitted;
            slot.submission = Some(id);
            slot.cancel_requested = false;
        }

        let (tx, rx) = oneshot::channel();
        let request = SubmitRequest {
            id,
            endpoint: self.endpoint,
            kind: self.kind,
            timeout: self.timeout,
            buffer,
            completer: Completer {
                id,
                tx: Some(tx),
                slot: self.slot.clone(),
                gate: self.gate.clone(),
            },
        };

        trace!(
            "Submitting {:?} transfer {} on endpoint {:#04x} ({} bytes)",
            self.kind,
            id.value(),
            self.endpoint,
            request.buffer.len()
        );

        match self.backend.submit(request) {
            Ok(()) => Ok(TransferFuture { rx }),
            Err(rejected) => {
                debug!(
                    "Engine rejected transfer on endpoint {:#04x}: {}",
                    self.endpoint, rejected.error
                );
                rejected.request.completer.disarm();
                Err(UsbError::Device(rejected.error))
            }
        }
    }

    /// Cancel the in-flight submission
    ///
    /// Returns `true` if a pending operation was cancelled. Its future then
    /// resolves with a cancellation status. Returns `false` when nothing is in
    /// flight or cancellation was already requested.
    pub fn cancel(&self) -> bool {
        let id = {
            let mut slot = lock(&self.slot);
            if slot.state != TransferState::Submitted || slot.cancel_requested {
                return false;
            }
            let Some(id) = slot.submission else {
                return false;
            };
            slot.cancel_requested = true;
            id
        };

        let cancelled = self.backend.cancel(id);
        if !cancelled {
            let mut slot = lock(&self.slot);
            if slot.submission == Some(id) {
                slot.cancel_requested = false;
            }
        }
        debug!(
            "Cancel transfer {} on endpoint {:#04x}: {}",
            id.value(),
            self.endpoint,
            cancelled
        );
        cancelled
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("endpoint", &self.endpoint)
            .field("kind", &self.kind)
            .field("timeout", &self.timeout)
            .field("state", &self.state())
            .finish()
    }
}

/// Outcome of one submission
#[derive(Debug)]
pub struct Completion {
    pub result: Result<(), UsbError>,
    /// The submitted buffer, including the setup packet for control transfers
    pub buffer: Bytes,
    /// Data-stage bytes actually transferred
    pub actual_length: usize,
}

impl Completion {
    pub fn is_cancelled(&self) -> bool {
        matches!(&self.result, Err(e) if e.is_cancelled())
    }

    /// Transferred bytes starting at `offset` into the buffer
    pub fn data_at(&self, offset: usize) -> Bytes {
        let start = offset.min(self.buffer.len());
        let end = (offset + self.actual_length).min(self.buffer.len());
        self.buffer.slice(start..end)
    }

    /// Transferred bytes for a non-control transfer
    pub fn into_data(self) -> Result<Bytes, UsbError> {
        self.result.clone()?;
        Ok(self.data_at(0))
    }
}

/// Resolves once the engine reports a submission's outcome
#[derive(Debug)]
#[must_use = "dropping the future does not cancel the transfer"]
pub struct TransferFuture {
    rx: oneshot::Receiver<Completion>,
}

impl Future for TransferFuture {
    type Output = Completion;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(completion)) => Poll::Ready(completion),
            Poll::Ready(Err(_)) => Poll::Ready(Completion {
                result: Err(UsbError::Device(DeviceError::NoDevice)),
                buffer: Bytes::new(),
                actual_length: 0,
            }),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Engine-side handle that resolves a [`TransferFuture`]
///
/// Dropping it without completing reports [`DeviceError::NoDevice`].
pub(crate) struct Completer {
    id: SubmissionId,
    tx: Option<oneshot::Sender<Completion>>,
    slot: Arc<Mutex<Slot>>,
    gate: Option<Arc<EndpointShared>>,
}

impl Completer {
    pub(crate) fn complete(
        mut self,
        result: Result<(), DeviceError>,
        buffer: BytesMut,
        actual_length: usize,
    ) {
        self.finish(result, buffer, actual_length);
    }

    /// Settle a rejected submission without delivering anything
    pub(crate) fn disarm(mut self) {
        if self.tx.take().is_some() {
            self.settle(TransferState::Error);
        }
    }

    fn finish(&mut self, result: Result<(), DeviceError>, buffer: BytesMut, actual_length: usize) {
        let Some(tx) = self.tx.take() else {
            return;
        };

        let state = match &result {
            Ok(()) => TransferState::Completed,
            Err(DeviceError::Cancelled) => TransferState::Cancelled,
            Err(_) => TransferState::Error,
        };
        self.settle(state);

        trace!(
            "Transfer {} finished: {:?}, {} bytes",
            self.id.value(),
            state,
            actual_length
        );

        let _ = tx.send(Completion {
            result: result.map_err(UsbError::from),
            buffer: buffer.freeze(),
            actual_length,
        });
    }

    // State is settled before the waiter is woken so that a resubmission from
    // the completion path sees a terminal state.
    fn settle(&self, state: TransferState) {
        {
            let mut slot = lock(&self.slot);
            if slot.submission == Some(self.id) {
                slot.state = state;
                slot.cancel_requested = false;
            }
        }
        if let Some(gate) = &self.gate {
            gate.finish(self.id);
        }
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.finish(Err(DeviceError::NoDevice), BytesMut::new(), 0);
        }
    }
}

impl fmt::Debug for Completer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("id", &self.id)
            .field("armed", &self.tx.is_some())
            .finish()
    }
}
