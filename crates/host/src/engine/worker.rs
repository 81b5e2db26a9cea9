//! Endpoint worker thread
//!
//! Each endpoint of an open device gets one thread that executes its queued
//! transfers in order. The queue is an async channel so submission never
//! blocks; the thread receives with `recv_blocking`.

use super::transfers::{SharedHandle, execute_transfer};
use crate::backend::{SubmissionId, SubmitRequest};
use crate::lock;
use common::DeviceError;
use protocol::{Direction, TransferKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, trace};

struct PendingEntry {
    cancelled: Arc<AtomicBool>,
    started: bool,
    /// Whether a started run can still be interrupted
    interruptible: bool,
}

type PendingMap = Arc<Mutex<HashMap<SubmissionId, PendingEntry>>>;

/// Queue and thread serving one endpoint
pub(crate) struct TransferWorker {
    tx: async_channel::Sender<SubmitRequest>,
    pending: PendingMap,
}

impl TransferWorker {
    /// Spawn a worker thread called `name`
    pub(crate) fn spawn(
        name: String,
        handle: SharedHandle,
        queue_depth: usize,
        slice: Duration,
    ) -> std::io::Result<Self> {
        let (tx, rx) = async_channel::bounded(queue_depth.max(1));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let thread_pending = pending.clone();
        std::thread::Builder::new()
            .name(name)
            .spawn(move || run(rx, thread_pending, handle, slice))?;

        Ok(Self { tx, pending })
    }

    /// Queue `request`; hands it back when the queue is full or closed
    pub(crate) fn enqueue(
        &self,
        request: SubmitRequest,
    ) -> Result<(), (DeviceError, SubmitRequest)> {
        let id = request.id;
        let interruptible = request.kind != TransferKind::Control
            && Direction::from_bits(request.endpoint) == Direction::In;

        lock(&self.pending).insert(
            id,
            PendingEntry {
                cancelled: Arc::new(AtomicBool::new(false)),
                started: false,
                interruptible,
            },
        );

        match self.tx.try_send(request) {
            Ok(()) => Ok(()),
            Err(e) => {
                lock(&self.pending).remove(&id);
                let error = if e.is_full() {
                    DeviceError::Busy
                } else {
                    DeviceError::NoDevice
                };
                Err((error, e.into_inner()))
            }
        }
    }

    /// Mark `id` cancelled if it has not run yet or can still be interrupted
    pub(crate) fn cancel(&self, id: SubmissionId) -> bool {
        let pending = lock(&self.pending);
        match pending.get(&id) {
            Some(entry) if !entry.started || entry.interruptible => {
                entry.cancelled.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    /// Stop accepting work and cancel everything queued or running
    pub(crate) fn shutdown(&self) {
        self.tx.close();
        for entry in lock(&self.pending).values() {
            entry.cancelled.store(true, Ordering::SeqCst);
        }
    }
}

fn run(
    rx: async_channel::Receiver<SubmitRequest>,
    pending: PendingMap,
    handle: SharedHandle,
    slice: Duration,
) {
    let name = std::thread::current()
        .name()
        .unwrap_or("usb-xfer")
        .to_string();
    info!("Transfer worker {} started", name);

    while let Ok(mut request) = rx.recv_blocking() {
        let cancelled = {
            let mut pending = lock(&pending);
            let flag = pending.get_mut(&request.id).and_then(|entry| {
                if entry.cancelled.load(Ordering::SeqCst) {
                    None
                } else {
                    entry.started = true;
                    Some(entry.cancelled.clone())
                }
            });
            if flag.is_none() {
                pending.remove(&request.id);
            }
            flag
        };
        let Some(cancelled) = cancelled else {
            trace!("Transfer {} cancelled before start", request.id.value());
            request.complete(Err(DeviceError::Cancelled), 0);
            continue;
        };

        // Wrap in catch_unwind so a panic fails one transfer, not the thread
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            execute_transfer(&handle, &mut request, slice, &cancelled)
        }))
        .unwrap_or_else(|e| {
            error!("Panic while executing transfer: {:?}", e);
            Err(DeviceError::Other(-99))
        });

        // The entry is removed under the lock so that a cancel() racing with
        // completion either sees it (and wins) or reports false.
        let was_cancelled = lock(&pending)
            .remove(&request.id)
            .is_some_and(|entry| entry.cancelled.load(Ordering::SeqCst));

        match result {
            _ if was_cancelled => request.complete(Err(DeviceError::Cancelled), 0),
            Ok(actual_length) => request.complete(Ok(()), actual_length),
            Err(e) => {
                debug!("Transfer {} failed: {}", request.id.value(), e);
                request.complete(Err(e), 0);
            }
        }
    }

    info!("Transfer worker {} stopped", name);
}
