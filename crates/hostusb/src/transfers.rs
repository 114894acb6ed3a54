//! Transfer scheduling and execution
//!
//! Async transfers are submitted to the event-pump thread, executed there as
//! blocking backend calls, and completed by marshaling the result back onto
//! the caller's event loop. The scheduler tracks every in-flight request so
//! completions can be matched to their tickets and completion callbacks fire
//! on the right thread.

use crate::backend::UsbSession;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};
use types::{Result, UsbError};

/// Buffer size for control IN transfers when the caller gives no buffer
pub(crate) const DEFAULT_CONTROL_IN: usize = 64;

/// Completed transfer: bytes moved plus any IN payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Number of bytes actually transferred
    pub actual: usize,
    /// Payload for IN transfers; empty for OUT
    pub data: Vec<u8>,
}

/// External cancellation request for a transfer
///
/// Cancellation is best-effort: it is honored before the pump picks the
/// transfer up, but a transfer already executing at the backend runs to
/// completion. The finish call must still be made exactly once either way.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

enum Slot {
    Pending,
    Done(Result<TransferOutcome>),
    Taken,
}

pub(crate) struct TicketState {
    slot: Mutex<Slot>,
    cancelled: AtomicBool,
}

impl TicketState {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Handle for one submitted async transfer
#[derive(Clone)]
pub struct TransferTicket {
    id: u64,
    state: Arc<TicketState>,
}

impl TransferTicket {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> Arc<TicketState> {
        Arc::clone(&self.state)
    }

    /// Request cancellation (best-effort, pre-execution only)
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether the transfer has completed (successfully or not)
    pub fn is_complete(&self) -> bool {
        !matches!(*self.state.slot.lock().unwrap(), Slot::Pending)
    }

    /// Retrieve the transfer result
    ///
    /// Must be called exactly once, after completion (typically from the
    /// completion callback). Calling early or twice yields an internal error.
    pub fn finish(&self) -> Result<TransferOutcome> {
        let mut slot = self.state.slot.lock().unwrap();
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Done(result) => result,
            Slot::Pending => {
                *slot = Slot::Pending;
                Err(UsbError::Internal(
                    "transfer has not completed yet".to_string(),
                ))
            }
            Slot::Taken => Err(UsbError::Internal(
                "transfer result already retrieved".to_string(),
            )),
        }
    }
}

/// Callback invoked on the caller's event loop when a transfer completes
pub type TransferCallback = Box<dyn FnOnce(&TransferTicket) + Send>;

struct Inflight {
    ticket: TransferTicket,
    callback: Option<TransferCallback>,
}

/// Registry of in-flight async transfers
pub(crate) struct TransferScheduler {
    next_id: AtomicU64,
    inflight: Mutex<HashMap<u64, Inflight>>,
}

impl TransferScheduler {
    pub(crate) fn new() -> Self {
        TransferScheduler {
            next_id: AtomicU64::new(1),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a ticket and track its completion callback
    pub(crate) fn register(&self, callback: Option<TransferCallback>) -> TransferTicket {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let ticket = TransferTicket {
            id,
            state: Arc::new(TicketState {
                slot: Mutex::new(Slot::Pending),
                cancelled: AtomicBool::new(false),
            }),
        };
        self.inflight.lock().unwrap().insert(
            id,
            Inflight {
                ticket: ticket.clone(),
                callback,
            },
        );
        ticket
    }

    /// Resolve a transfer; runs on the caller's event loop
    pub(crate) fn complete(&self, id: u64, result: Result<TransferOutcome>) {
        let entry = self.inflight.lock().unwrap().remove(&id);
        let Some(entry) = entry else {
            // completion raced context teardown; nothing to deliver to
            debug!("dropping completion for unknown transfer {}", id);
            return;
        };
        *entry.ticket.state.slot.lock().unwrap() = Slot::Done(result);
        if let Some(callback) = entry.callback {
            callback(&entry.ticket);
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }
}

/// One transfer request, direction encoded in the request-type/endpoint bit
#[derive(Debug, Clone)]
pub(crate) enum TransferKind {
    Control {
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: Vec<u8>,
    },
    Bulk {
        endpoint: u8,
        data: Vec<u8>,
    },
    Interrupt {
        endpoint: u8,
        data: Vec<u8>,
    },
}

/// Execute a transfer against an open session (pump thread)
///
/// For IN transfers the data vec length specifies the buffer size; for OUT
/// transfers it carries the payload.
pub(crate) fn execute_transfer(
    session: &mut dyn UsbSession,
    kind: TransferKind,
    timeout: Duration,
) -> Result<TransferOutcome> {
    match kind {
        TransferKind::Control {
            request_type,
            request,
            value,
            index,
            data,
        } => {
            let is_in = (request_type & 0x80) != 0;
            if is_in {
                let size = if data.is_empty() {
                    DEFAULT_CONTROL_IN
                } else {
                    data.len()
                };
                let mut buf = vec![0u8; size];
                let len =
                    session.read_control(request_type, request, value, index, &mut buf, timeout)?;
                buf.truncate(len);
                Ok(TransferOutcome {
                    actual: len,
                    data: buf,
                })
            } else {
                let len =
                    session.write_control(request_type, request, value, index, &data, timeout)?;
                Ok(TransferOutcome {
                    actual: len,
                    data: Vec::new(),
                })
            }
        }
        TransferKind::Bulk { endpoint, data } => {
            if (endpoint & 0x80) != 0 {
                let mut buf = vec![0u8; data.len()];
                let len = session.read_bulk(endpoint, &mut buf, timeout)?;
                buf.truncate(len);
                Ok(TransferOutcome {
                    actual: len,
                    data: buf,
                })
            } else {
                let len = session.write_bulk(endpoint, &data, timeout)?;
                Ok(TransferOutcome {
                    actual: len,
                    data: Vec::new(),
                })
            }
        }
        TransferKind::Interrupt { endpoint, data } => {
            if (endpoint & 0x80) != 0 {
                let mut buf = vec![0u8; data.len()];
                let len = session.read_interrupt(endpoint, &mut buf, timeout)?;
                buf.truncate(len);
                Ok(TransferOutcome {
                    actual: len,
                    data: buf,
                })
            } else {
                let len = session.write_interrupt(endpoint, &data, timeout)?;
                if len < data.len() {
                    warn!(
                        "short interrupt write on endpoint {:#04x}: {} of {} bytes",
                        endpoint,
                        len,
                        data.len()
                    );
                }
                Ok(TransferOutcome {
                    actual: len,
                    data: Vec::new(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_lifecycle() {
        let scheduler = TransferScheduler::new();
        let ticket = scheduler.register(None);
        assert!(!ticket.is_complete());
        assert_eq!(scheduler.pending(), 1);

        // finishing early is an error and leaves the ticket pending
        assert!(matches!(ticket.finish(), Err(UsbError::Internal(_))));
        assert!(!ticket.is_complete());

        scheduler.complete(
            ticket.id(),
            Ok(TransferOutcome {
                actual: 3,
                data: vec![1, 2, 3],
            }),
        );
        assert!(ticket.is_complete());
        assert_eq!(scheduler.pending(), 0);

        let outcome = ticket.finish().unwrap();
        assert_eq!(outcome.actual, 3);

        // a second finish is rejected
        assert!(matches!(ticket.finish(), Err(UsbError::Internal(_))));
    }

    #[test]
    fn test_completion_callback_fires_once() {
        let scheduler = TransferScheduler::new();
        let hits = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&hits);
        let ticket = scheduler.register(Some(Box::new(move |ticket| {
            seen.fetch_add(1, Ordering::SeqCst);
            assert!(ticket.finish().is_err());
        })));
        scheduler.complete(ticket.id(), Err(UsbError::TimedOut));
        scheduler.complete(ticket.id(), Err(UsbError::TimedOut));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stale_completion_is_dropped() {
        let scheduler = TransferScheduler::new();
        scheduler.complete(
            99,
            Ok(TransferOutcome {
                actual: 0,
                data: Vec::new(),
            }),
        );
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_cancel_handle() {
        let handle = CancelHandle::new();
        assert!(!handle.is_cancelled());
        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(handle.clone().is_cancelled());
    }
}
