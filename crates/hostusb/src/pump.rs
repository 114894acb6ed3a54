//! Background event pump
//!
//! One dedicated thread per context drives the backend's event loop in
//! bounded 100 ms waits, owns the hotplug registration, and executes
//! submitted transfers as blocking backend calls. Results and poll ticks are
//! marshaled back through the context's event queue; the pump never touches
//! the device collection itself.
//!
//! The thread holds only a weak reference to the shared state, so a context
//! dropped without a clean shutdown still lets the pump exit on its next
//! iteration.

use crate::backend::{BackendEvent, UsbBackend};
use crate::context::{ContextShared, Marshal};
use crate::device::UsbDevice;
use crate::transfers::{CancelHandle, TicketState, TransferKind};
use async_channel::{Receiver, Sender};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use types::UsbError;

/// Bound on each backend event wait so shutdown is noticed promptly
const EVENT_WAIT: Duration = Duration::from_millis(100);
/// Re-scan cadence when the backend cannot deliver hotplug events
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Idle sleep between iterations in poll mode
const POLL_SLEEP: Duration = Duration::from_millis(50);
/// Backoff after a failed event-loop iteration
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Request sent from the context to the pump thread
pub(crate) enum PumpCommand<B: UsbBackend> {
    Submit {
        id: u64,
        device: Arc<UsbDevice<B>>,
        kind: TransferKind,
        timeout: Duration,
        ticket: Arc<TicketState>,
        cancel: Option<CancelHandle>,
    },
    Shutdown,
}

pub(crate) fn spawn<B: UsbBackend>(
    shared: Weak<ContextShared<B>>,
    cmd_rx: Receiver<PumpCommand<B>>,
    hotplug_sink: Sender<BackendEvent<B::Device>>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("usb-event-pump".to_string())
        .spawn(move || run(shared, cmd_rx, hotplug_sink))
        .expect("failed to spawn USB event pump thread")
}

fn run<B: UsbBackend>(
    shared: Weak<ContextShared<B>>,
    cmd_rx: Receiver<PumpCommand<B>>,
    hotplug_sink: Sender<BackendEvent<B::Device>>,
) {
    info!("USB event pump started");

    // The registration token is not Send; it lives and dies on this thread.
    let guard = {
        let Some(ctx) = shared.upgrade() else {
            return;
        };
        if ctx.backend.has_hotplug() {
            match ctx.backend.register_hotplug(hotplug_sink) {
                Ok(guard) => Some(guard),
                Err(e) => {
                    warn!("hotplug registration failed, falling back to polling: {}", e);
                    None
                }
            }
        } else {
            debug!("backend has no hotplug support, polling every {:?}", POLL_INTERVAL);
            None
        }
    };
    let polling = guard.is_none();
    let mut last_poll = Instant::now();

    'outer: loop {
        let Some(ctx) = shared.upgrade() else {
            break;
        };
        if !ctx.running.load(Ordering::SeqCst) {
            break;
        }

        while let Ok(command) = cmd_rx.try_recv() {
            match command {
                PumpCommand::Shutdown => break 'outer,
                PumpCommand::Submit {
                    id,
                    device,
                    kind,
                    timeout,
                    ticket,
                    cancel,
                } => {
                    let cancelled = ticket.is_cancelled()
                        || cancel.as_ref().map(CancelHandle::is_cancelled).unwrap_or(false);
                    let result = if cancelled {
                        Err(UsbError::Cancelled)
                    } else {
                        device.execute_blocking(kind, timeout)
                    };
                    let _ = ctx.event_tx.send_blocking(Marshal::TransferDone { id, result });
                }
            }
        }

        if polling {
            if last_poll.elapsed() >= POLL_INTERVAL {
                last_poll = Instant::now();
                let _ = ctx.event_tx.send_blocking(Marshal::Rescan);
            }
            drop(ctx);
            std::thread::sleep(POLL_SLEEP);
        } else if let Err(e) = ctx.backend.handle_events(EVENT_WAIT) {
            warn!("USB event handling error: {}", e);
            drop(ctx);
            std::thread::sleep(ERROR_BACKOFF);
        }
    }

    drop(guard);
    info!("USB event pump stopped");
}
