//! Device wrapper
//!
//! A [`UsbDevice`] pairs a backend device reference (or an emulated snapshot)
//! with cached descriptor fields, the derived platform identity, and the
//! open-session state machine. Devices are created by the context and handed
//! out as `Arc`s; they hold only a weak link back so a dropped context is
//! observable as `NoDevice` rather than a cycle.

use crate::backend::{UsbBackend, UsbSession};
use crate::context::{ContextShared, Marshal};
use crate::pump::PumpCommand;
use crate::snapshot::{interface_from_snapshot, interface_to_snapshot, replay_transfer};
use crate::transfers::{
    CancelHandle, TransferCallback, TransferKind, TransferOutcome, TransferTicket,
    execute_transfer,
};
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use types::{
    ClaimFlags, DeviceDescriptor, DeviceSnapshot, InterfaceDescriptor, PlatformId, Result, Speed,
    UsbError,
};

/// Extra slack granted to a blocking transfer beyond its backend timeout, so
/// the backend gets a chance to report its own timeout first
const BLOCKING_GRACE: Duration = Duration::from_secs(2);

pub(crate) enum Backing<D> {
    /// Physical device known to the backend
    Raw(D),
    /// Emulated device materialized from a snapshot
    Emulated(DeviceSnapshot),
}

enum Session {
    Closed,
    Open(Box<dyn UsbSession>),
    OpenEmulated,
}

/// One device in the context's collection
pub struct UsbDevice<B: UsbBackend> {
    backing: Backing<B::Device>,
    context: Weak<ContextShared<B>>,
    weak_self: Weak<UsbDevice<B>>,
    platform_id: PlatformId,
    bus: u8,
    address: u8,
    ports: Vec<u8>,
    speed: Speed,
    descriptor: DeviceDescriptor,
    created: u64,
    tags: Vec<String>,
    session: Mutex<Session>,
    /// Set once the device has been announced via an Added event; removal
    /// notifications are only raised for announced devices
    pub(crate) announced: AtomicBool,
}

// Not derivable: `B::Device` carries no `Debug` bound.
impl<B: UsbBackend> fmt::Debug for UsbDevice<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("UsbDevice").field(&self.describe()).finish()
    }
}

impl<B: UsbBackend> UsbDevice<B> {
    pub(crate) fn from_raw(
        context: Weak<ContextShared<B>>,
        backend: &B,
        raw: B::Device,
    ) -> Result<Self> {
        let descriptor = backend.device_descriptor(&raw)?;
        let bus = backend.bus_number(&raw);
        let address = backend.address(&raw);
        let ports = backend.port_numbers(&raw);
        let platform_id = PlatformId::from_topology(bus, &ports);
        let speed = backend.speed(&raw);
        Ok(UsbDevice {
            backing: Backing::Raw(raw),
            context,
            weak_self: Weak::new(),
            platform_id,
            bus,
            address,
            ports,
            speed,
            descriptor,
            created: now_secs(),
            tags: Vec::new(),
            session: Mutex::new(Session::Closed),
            announced: AtomicBool::new(false),
        })
    }

    /// Materialize an emulated device from a snapshot entry
    ///
    /// Emulated devices live on bus 0 with addresses handed out by the
    /// context, keeping the (bus, address) uniqueness invariant intact.
    pub(crate) fn from_snapshot(
        context: Weak<ContextShared<B>>,
        snap: &DeviceSnapshot,
        address: u8,
    ) -> Self {
        let descriptor = DeviceDescriptor {
            vendor_id: snap.id_vendor,
            product_id: snap.id_product,
            class: 0,
            subclass: 0,
            protocol: 0,
            bcd_device: snap.device_bcd,
            bcd_usb: snap.usb_bcd,
            manufacturer_index: snap.manufacturer_index,
            product_index: snap.product_index,
            serial_index: 0,
            num_configurations: 1,
        };
        let created = if snap.created != 0 {
            snap.created
        } else {
            now_secs()
        };
        // recover the port chain from the recorded identity where possible
        let ports: Vec<u8> = snap
            .platform_id
            .split(':')
            .skip(2)
            .filter_map(|part| part.parse().ok())
            .collect();
        UsbDevice {
            backing: Backing::Emulated(snap.clone()),
            context,
            weak_self: Weak::new(),
            platform_id: PlatformId::from_string(&snap.platform_id),
            bus: 0,
            address,
            ports,
            speed: Speed::Unknown,
            descriptor,
            created,
            tags: snap.tags.clone(),
            session: Mutex::new(Session::Closed),
            announced: AtomicBool::new(false),
        }
    }

    /// Finalize construction, wiring up the self-reference used for transfer
    /// submission
    pub(crate) fn into_shared(mut self) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            self.weak_self = weak.clone();
            self
        })
    }

    pub fn bus_number(&self) -> u8 {
        self.bus
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn platform_id(&self) -> &PlatformId {
        &self.platform_id
    }

    /// Port on the immediate parent hub; 0 for a root device
    pub fn port_number(&self) -> u8 {
        self.ports.last().copied().unwrap_or(0)
    }

    /// Chain of port numbers from the root hub down to this device
    pub fn port_numbers(&self) -> &[u8] {
        &self.ports
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn vendor_id(&self) -> u16 {
        self.descriptor.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.descriptor.product_id
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    /// Creation time, seconds since the Unix epoch
    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn is_emulated(&self) -> bool {
        matches!(self.backing, Backing::Emulated(_))
    }

    /// Short human-readable identity for log lines
    pub fn describe(&self) -> String {
        format!(
            "{:04x}:{:04x} [bus {:03} addr {:03}]",
            self.descriptor.vendor_id, self.descriptor.product_id, self.bus, self.address
        )
    }

    fn shared(&self) -> Result<Arc<ContextShared<B>>> {
        self.context.upgrade().ok_or_else(|| {
            UsbError::NoDevice(format!("context destroyed for {}", self.describe()))
        })
    }

    fn auto_open_active(&self) -> bool {
        self.shared()
            .map(|s| s.flags().auto_open_devices)
            .unwrap_or(false)
    }

    /// Open the device for I/O
    ///
    /// A no-op success when the context auto-opens devices; an error if the
    /// device is already open.
    pub fn open(&self) -> Result<()> {
        if self.auto_open_active() {
            return Ok(());
        }
        self.open_session()
    }

    pub(crate) fn open_session(&self) -> Result<()> {
        let shared = self.shared()?;
        let mut session = self.session.lock().unwrap();
        if !matches!(*session, Session::Closed) {
            return Err(UsbError::AlreadyOpen(self.describe()));
        }
        match &self.backing {
            Backing::Raw(raw) => {
                *session = Session::Open(shared.backend.open(raw)?);
            }
            Backing::Emulated(_) => {
                *session = Session::OpenEmulated;
            }
        }
        debug!("opened {}", self.describe());
        Ok(())
    }

    /// Close the device
    ///
    /// A no-op success under auto-open; an error if the device is not open.
    pub fn close(&self) -> Result<()> {
        if self.auto_open_active() {
            return Ok(());
        }
        self.close_session()
    }

    pub(crate) fn close_session(&self) -> Result<()> {
        let mut session = self.session.lock().unwrap();
        if matches!(*session, Session::Closed) {
            return Err(UsbError::NotOpen(self.describe()));
        }
        *session = Session::Closed;
        debug!("closed {}", self.describe());
        Ok(())
    }

    /// Drop the session unconditionally (removal and teardown path)
    pub(crate) fn force_close(&self) {
        *self.session.lock().unwrap() = Session::Closed;
    }

    pub fn is_open(&self) -> bool {
        !matches!(*self.session.lock().unwrap(), Session::Closed)
    }

    /// Perform a port reset
    ///
    /// The device dropping off the bus mid-reset is expected (it will come
    /// back through hotplug as a new instance) and is reported as success.
    pub fn reset(&self) -> Result<()> {
        let mut session = self.session.lock().unwrap();
        match &mut *session {
            Session::Closed => Err(UsbError::NotOpen(self.describe())),
            Session::OpenEmulated => Ok(()),
            Session::Open(s) => match s.reset() {
                Ok(()) => Ok(()),
                Err(UsbError::NoDevice(_)) | Err(UsbError::NotFound(_)) => {
                    debug!("{} detached during reset", self.describe());
                    Ok(())
                }
                Err(e) => Err(e),
            },
        }
    }

    /// Currently active configuration value
    pub fn configuration(&self) -> Result<u8> {
        let mut session = self.session.lock().unwrap();
        match &mut *session {
            Session::Closed => Err(UsbError::NotOpen(self.describe())),
            Session::OpenEmulated => Ok(1),
            Session::Open(s) => s.configuration(),
        }
    }

    /// Select a configuration, skipping the bus request if already active
    pub fn set_configuration(&self, value: u8) -> Result<()> {
        let mut session = self.session.lock().unwrap();
        match &mut *session {
            Session::Closed => Err(UsbError::NotOpen(self.describe())),
            Session::OpenEmulated => Ok(()),
            Session::Open(s) => {
                if s.configuration().ok() == Some(value) {
                    debug!("configuration {} already active on {}", value, self.describe());
                    return Ok(());
                }
                s.set_configuration(value)
            }
        }
    }

    /// Claim an interface
    ///
    /// With `bind_kernel_driver` set, any bound kernel driver is detached
    /// first; not-found, not-supported, and busy outcomes of the detach are
    /// tolerated, a failed claim is not.
    pub fn claim_interface(&self, number: u8, flags: ClaimFlags) -> Result<()> {
        let mut session = self.session.lock().unwrap();
        match &mut *session {
            Session::Closed => Err(UsbError::NotOpen(self.describe())),
            Session::OpenEmulated => Ok(()),
            Session::Open(s) => {
                if flags.bind_kernel_driver {
                    tolerate_driver_outcome(s.detach_kernel_driver(number), "detach", number)?;
                }
                s.claim_interface(number)
            }
        }
    }

    /// Release an interface, reattaching the kernel driver when requested
    pub fn release_interface(&self, number: u8, flags: ClaimFlags) -> Result<()> {
        let mut session = self.session.lock().unwrap();
        match &mut *session {
            Session::Closed => Err(UsbError::NotOpen(self.describe())),
            Session::OpenEmulated => Ok(()),
            Session::Open(s) => {
                s.release_interface(number)?;
                if flags.bind_kernel_driver {
                    tolerate_driver_outcome(s.attach_kernel_driver(number), "attach", number)?;
                }
                Ok(())
            }
        }
    }

    pub fn set_interface_alt_setting(&self, interface: u8, alt: u8) -> Result<()> {
        let mut session = self.session.lock().unwrap();
        match &mut *session {
            Session::Closed => Err(UsbError::NotOpen(self.describe())),
            Session::OpenEmulated => Ok(()),
            Session::Open(s) => s.set_alternate_setting(interface, alt),
        }
    }

    /// Read a string descriptor as ASCII
    pub fn string_descriptor(&self, index: u8) -> Result<String> {
        let mut session = self.session.lock().unwrap();
        match &mut *session {
            Session::Closed => Err(UsbError::NotOpen(self.describe())),
            Session::OpenEmulated => Err(UsbError::NotSupported(
                "emulated devices carry no string descriptors".to_string(),
            )),
            Session::Open(s) => s.read_string_descriptor_ascii(index),
        }
    }

    /// Read raw string descriptor bytes for a specific language
    pub fn string_descriptor_bytes(
        &self,
        index: u8,
        lang_id: u16,
        max_length: usize,
    ) -> Result<Vec<u8>> {
        let mut session = self.session.lock().unwrap();
        match &mut *session {
            Session::Closed => Err(UsbError::NotOpen(self.describe())),
            Session::OpenEmulated => Err(UsbError::NotSupported(
                "emulated devices carry no string descriptors".to_string(),
            )),
            Session::Open(s) => s.read_string_descriptor(index, lang_id, max_length),
        }
    }

    /// Interfaces of the active configuration
    ///
    /// Parsed on demand from the backend; emulated devices answer from their
    /// snapshot. Does not require the device to be open.
    pub fn interfaces(&self) -> Result<Vec<InterfaceDescriptor>> {
        match &self.backing {
            Backing::Raw(raw) => {
                let shared = self.shared()?;
                shared.backend.config_descriptor(raw)
            }
            Backing::Emulated(snap) => {
                Ok(snap.interfaces.iter().map(interface_from_snapshot).collect())
            }
        }
    }

    /// Find the first interface matching a class/subclass/protocol triple
    pub fn interface(&self, class: u8, subclass: u8, protocol: u8) -> Result<InterfaceDescriptor> {
        self.interfaces()?
            .into_iter()
            .find(|i| i.matches(class, subclass, protocol))
            .ok_or_else(|| {
                UsbError::NotSupported(format!(
                    "no interface {:02x}/{:02x}/{:02x} on {}",
                    class,
                    subclass,
                    protocol,
                    self.describe()
                ))
            })
    }

    /// String descriptor index of the first interface matching the triple
    pub fn custom_string_index(&self, class: u8, subclass: u8, protocol: u8) -> Result<u8> {
        self.interface(class, subclass, protocol)
            .map(|i| i.string_index)
    }

    /// Snapshot form of this device for save/replay
    pub fn to_snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            platform_id: self.platform_id.to_string(),
            created: self.created,
            tags: self.tags.clone(),
            id_vendor: self.descriptor.vendor_id,
            id_product: self.descriptor.product_id,
            device_bcd: self.descriptor.bcd_device,
            usb_bcd: self.descriptor.bcd_usb,
            manufacturer_index: self.descriptor.manufacturer_index,
            product_index: self.descriptor.product_index,
            interfaces: self
                .interfaces()
                .unwrap_or_default()
                .iter()
                .map(interface_to_snapshot)
                .collect(),
            events: match &self.backing {
                Backing::Emulated(snap) => snap.events.clone(),
                Backing::Raw(_) => Vec::new(),
            },
        }
    }

    /// Blocking control transfer; direction comes from bit 7 of
    /// `request_type`. For IN transfers `data.len()` sizes the read buffer
    /// (64 bytes if empty).
    #[allow(clippy::too_many_arguments)]
    pub fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: Vec<u8>,
        timeout: Duration,
        cancel: Option<&CancelHandle>,
    ) -> Result<TransferOutcome> {
        self.blocking_transfer(
            TransferKind::Control {
                request_type,
                request,
                value,
                index,
                data,
            },
            timeout,
            cancel,
        )
    }

    /// Async control transfer; the callback fires during event processing
    #[allow(clippy::too_many_arguments)]
    pub fn control_transfer_async(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: Vec<u8>,
        timeout: Duration,
        cancel: Option<&CancelHandle>,
        callback: Option<TransferCallback>,
    ) -> Result<TransferTicket> {
        self.submit(
            TransferKind::Control {
                request_type,
                request,
                value,
                index,
                data,
            },
            timeout,
            cancel,
            callback,
        )
    }

    /// Blocking bulk transfer; direction comes from bit 7 of `endpoint`.
    /// For IN endpoints `data.len()` sizes the read buffer.
    pub fn bulk_transfer(
        &self,
        endpoint: u8,
        data: Vec<u8>,
        timeout: Duration,
        cancel: Option<&CancelHandle>,
    ) -> Result<TransferOutcome> {
        self.blocking_transfer(TransferKind::Bulk { endpoint, data }, timeout, cancel)
    }

    pub fn bulk_transfer_async(
        &self,
        endpoint: u8,
        data: Vec<u8>,
        timeout: Duration,
        cancel: Option<&CancelHandle>,
        callback: Option<TransferCallback>,
    ) -> Result<TransferTicket> {
        self.submit(TransferKind::Bulk { endpoint, data }, timeout, cancel, callback)
    }

    /// Blocking interrupt transfer; same buffer conventions as bulk
    pub fn interrupt_transfer(
        &self,
        endpoint: u8,
        data: Vec<u8>,
        timeout: Duration,
        cancel: Option<&CancelHandle>,
    ) -> Result<TransferOutcome> {
        self.blocking_transfer(TransferKind::Interrupt { endpoint, data }, timeout, cancel)
    }

    pub fn interrupt_transfer_async(
        &self,
        endpoint: u8,
        data: Vec<u8>,
        timeout: Duration,
        cancel: Option<&CancelHandle>,
        callback: Option<TransferCallback>,
    ) -> Result<TransferTicket> {
        self.submit(
            TransferKind::Interrupt { endpoint, data },
            timeout,
            cancel,
            callback,
        )
    }

    /// Submit a transfer for execution on the event-pump thread
    fn submit(
        &self,
        kind: TransferKind,
        timeout: Duration,
        cancel: Option<&CancelHandle>,
        callback: Option<TransferCallback>,
    ) -> Result<TransferTicket> {
        let shared = self.shared()?;
        if matches!(*self.session.lock().unwrap(), Session::Closed) {
            return Err(UsbError::NotOpen(self.describe()));
        }
        if cancel.map(CancelHandle::is_cancelled).unwrap_or(false) {
            return Err(UsbError::Cancelled);
        }

        let ticket = shared.scheduler.register(callback);
        match &self.backing {
            Backing::Emulated(snap) => {
                // replay immediately, but complete through the marshal queue
                // so callbacks still fire on the caller's event loop
                let result = replay_transfer(snap, &kind);
                shared
                    .event_tx
                    .send_blocking(Marshal::TransferDone {
                        id: ticket.id(),
                        result,
                    })
                    .map_err(|_| UsbError::Internal("event queue closed".to_string()))?;
            }
            Backing::Raw(_) => {
                let device = self
                    .weak_self
                    .upgrade()
                    .ok_or_else(|| UsbError::Internal("device not shared".to_string()))?;
                shared
                    .cmd_tx
                    .send_blocking(PumpCommand::Submit {
                        id: ticket.id(),
                        device,
                        kind,
                        timeout,
                        ticket: ticket.state(),
                        cancel: cancel.cloned(),
                    })
                    .map_err(|_| UsbError::Internal("event pump stopped".to_string()))?;
            }
        }
        Ok(ticket)
    }

    /// Blocking wrapper: submit, drive the event loop until completion
    fn blocking_transfer(
        &self,
        kind: TransferKind,
        timeout: Duration,
        cancel: Option<&CancelHandle>,
    ) -> Result<TransferOutcome> {
        let shared = self.shared()?;
        let ticket = self.submit(kind, timeout, cancel, None)?;
        let deadline = Instant::now() + timeout + BLOCKING_GRACE;
        if !shared.process_until(deadline, || ticket.is_complete()) {
            ticket.cancel();
            warn!("blocking transfer on {} never completed", self.describe());
            return Err(UsbError::TimedOut);
        }
        ticket.finish()
    }

    /// Run a transfer against the open session; pump thread only
    pub(crate) fn execute_blocking(
        &self,
        kind: TransferKind,
        timeout: Duration,
    ) -> Result<TransferOutcome> {
        let mut session = self.session.lock().unwrap();
        match &mut *session {
            Session::Closed => Err(UsbError::NotOpen(self.describe())),
            Session::OpenEmulated => Err(UsbError::Internal(
                "emulated transfer routed to the pump".to_string(),
            )),
            Session::Open(s) => execute_transfer(s.as_mut(), kind, timeout),
        }
    }
}

/// Kernel-driver detach/attach outcomes that do not fail the claim flow:
/// no driver bound, the platform has no notion of one, or the device went
/// away (reported as busy/no-device by the backend)
fn tolerate_driver_outcome(result: Result<()>, action: &str, number: u8) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(UsbError::NotFound(_)) | Err(UsbError::NotSupported(_)) | Err(UsbError::NoDevice(_)) => {
            debug!("kernel driver {} on interface {} skipped", action, number);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
