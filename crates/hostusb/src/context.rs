//! Device context
//!
//! The context owns the device collection, the subscriber list, and the
//! background event pump. Hotplug callbacks and transfer completions only
//! ever enqueue; all collection mutation and subscriber notification happens
//! on whichever thread calls [`DeviceContext::process_events`] (or one of the
//! blocking waits that drive it internally), so callers never observe the
//! collection change underneath them.

use crate::backend::rusb::RusbBackend;
use crate::backend::{BackendEvent, UsbBackend};
use crate::device::UsbDevice;
use crate::names::NameResolver;
use crate::pump::{self, PumpCommand};
use crate::replug::ReplugWaiter;
use crate::transfers::{TransferOutcome, TransferScheduler};
use async_channel::{Receiver, Sender};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use types::{ContextFlags, PlatformId, Result, UsbError};

/// Sleep granularity of the blocking event-processing waits
const EVENT_STEP: Duration = Duration::from_millis(5);

/// Change notification delivered to subscribers during event processing
pub enum DeviceEvent<B: UsbBackend> {
    /// A device joined the collection
    Added(Arc<UsbDevice<B>>),
    /// A device left the collection
    Removed(Arc<UsbDevice<B>>),
    /// A device was replaced in place (snapshot reload)
    Changed(Arc<UsbDevice<B>>),
}

impl<B: UsbBackend> DeviceEvent<B> {
    /// The device the event refers to
    pub fn device(&self) -> &Arc<UsbDevice<B>> {
        match self {
            DeviceEvent::Added(d) | DeviceEvent::Removed(d) | DeviceEvent::Changed(d) => d,
        }
    }
}

/// Token returned by [`DeviceContext::subscribe`]
pub type SubscriptionId = u64;

/// Work marshaled onto the event-processing thread
pub(crate) enum Marshal {
    /// Re-scan the bus and diff against the collection (poll fallback)
    Rescan,
    /// An async transfer finished on the pump thread
    TransferDone {
        id: u64,
        result: Result<TransferOutcome>,
    },
}

struct Subscriber<B: UsbBackend> {
    id: SubscriptionId,
    callback: Box<dyn FnMut(&DeviceEvent<B>) + Send>,
}

struct SubscriberSet<B: UsbBackend> {
    list: Vec<Subscriber<B>>,
    /// Thread currently delivering events, with its re-entry depth
    dispatcher: Option<(ThreadId, usize)>,
}

pub(crate) struct ContextState<B: UsbBackend> {
    pub(crate) devices: Vec<Arc<UsbDevice<B>>>,
    pub(crate) replug: HashMap<PlatformId, ReplugWaiter<B>>,
    /// Address allocator for emulated devices (bus 0)
    pub(crate) next_emulated_address: u8,
}

/// State shared between the context handle and the pump thread
pub(crate) struct ContextShared<B: UsbBackend> {
    pub(crate) backend: B,
    pub(crate) weak_self: Weak<ContextShared<B>>,
    pub(crate) state: Mutex<ContextState<B>>,
    flags: Mutex<ContextFlags>,
    pub(crate) running: AtomicBool,
    enumerated: AtomicBool,
    enumerate_lock: Mutex<()>,
    pub(crate) event_tx: Sender<Marshal>,
    event_rx: Receiver<Marshal>,
    backend_rx: Receiver<BackendEvent<B::Device>>,
    pub(crate) cmd_tx: Sender<PumpCommand<B>>,
    pub(crate) scheduler: TransferScheduler,
    subscribers: Mutex<SubscriberSet<B>>,
    dispatch_idle: Condvar,
    next_subscriber: AtomicU64,
    resolver: Mutex<Option<Arc<dyn NameResolver>>>,
    names: Mutex<HashMap<(u16, u16), (Option<String>, Option<String>)>>,
}

/// Thread-safe entry point to the host's USB devices
pub struct DeviceContext<B: UsbBackend> {
    pub(crate) shared: Arc<ContextShared<B>>,
    pump: Option<JoinHandle<()>>,
}

impl DeviceContext<RusbBackend> {
    /// Context over the system libusb binding
    pub fn new_system(flags: ContextFlags) -> Result<Self> {
        Ok(DeviceContext::new(RusbBackend::new()?, flags))
    }
}

impl<B: UsbBackend> DeviceContext<B> {
    /// Create a context over `backend` and start its event pump
    ///
    /// No devices are visible until [`enumerate`](Self::enumerate) runs (the
    /// accessors trigger it on first use).
    pub fn new(backend: B, flags: ContextFlags) -> Self {
        let (event_tx, event_rx) = async_channel::unbounded();
        let (cmd_tx, cmd_rx) = async_channel::unbounded();
        let (backend_tx, backend_rx) = async_channel::unbounded();

        let shared = Arc::new_cyclic(|weak| ContextShared {
            backend,
            weak_self: weak.clone(),
            state: Mutex::new(ContextState {
                devices: Vec::new(),
                replug: HashMap::new(),
                next_emulated_address: 1,
            }),
            flags: Mutex::new(flags),
            running: AtomicBool::new(true),
            enumerated: AtomicBool::new(false),
            enumerate_lock: Mutex::new(()),
            event_tx,
            event_rx,
            backend_rx,
            cmd_tx,
            scheduler: TransferScheduler::new(),
            subscribers: Mutex::new(SubscriberSet {
                list: Vec::new(),
                dispatcher: None,
            }),
            dispatch_idle: Condvar::new(),
            next_subscriber: AtomicU64::new(1),
            resolver: Mutex::new(None),
            names: Mutex::new(HashMap::new()),
        });

        let pump = pump::spawn(Arc::downgrade(&shared), cmd_rx, backend_tx);
        DeviceContext {
            shared,
            pump: Some(pump),
        }
    }

    /// Perform the initial bus scan
    ///
    /// Idempotent: only the first call scans; the initial device set is
    /// announced to subscribers exactly once, in discovery order. Arrivals
    /// queued before this point are folded into the scan silently.
    pub fn enumerate(&self) {
        if self.shared.enumerated.load(Ordering::SeqCst) {
            return;
        }
        let _guard = self.shared.enumerate_lock.lock().unwrap();
        if self.shared.enumerated.load(Ordering::SeqCst) {
            return;
        }

        self.shared.process_pending();
        self.shared.do_rescan();
        self.shared.enumerated.store(true, Ordering::SeqCst);

        let devices = self.shared.state.lock().unwrap().devices.clone();
        info!("enumerated {} devices", devices.len());
        for device in devices {
            if !device.announced.swap(true, Ordering::SeqCst) {
                self.shared.emit(&DeviceEvent::Added(device.clone()));
            }
        }
    }

    /// Snapshot of the current device collection
    ///
    /// Triggers enumeration on first use but does not drain the event queue:
    /// hotplug arrivals become visible only after
    /// [`process_events`](Self::process_events).
    pub fn devices(&self) -> Vec<Arc<UsbDevice<B>>> {
        self.enumerate();
        self.shared.state.lock().unwrap().devices.clone()
    }

    pub fn find_by_bus_address(&self, bus: u8, address: u8) -> Result<Arc<UsbDevice<B>>> {
        self.enumerate();
        self.shared
            .state
            .lock()
            .unwrap()
            .devices
            .iter()
            .find(|d| d.bus_number() == bus && d.address() == address)
            .cloned()
            .ok_or_else(|| {
                UsbError::NotFound(format!("no device on bus {:03} address {:03}", bus, address))
            })
    }

    pub fn find_by_platform_id(&self, id: &PlatformId) -> Result<Arc<UsbDevice<B>>> {
        self.enumerate();
        self.shared
            .state
            .lock()
            .unwrap()
            .devices
            .iter()
            .find(|d| d.platform_id() == id)
            .cloned()
            .ok_or_else(|| UsbError::NotFound(format!("no device with platform id {}", id)))
    }

    /// First device matching the vendor/product pair
    pub fn find_by_vid_pid(&self, vendor_id: u16, product_id: u16) -> Result<Arc<UsbDevice<B>>> {
        self.enumerate();
        self.shared
            .state
            .lock()
            .unwrap()
            .devices
            .iter()
            .find(|d| d.vendor_id() == vendor_id && d.product_id() == product_id)
            .cloned()
            .ok_or_else(|| {
                UsbError::NotFound(format!("no device {:04x}:{:04x}", vendor_id, product_id))
            })
    }

    pub fn flags(&self) -> ContextFlags {
        self.shared.flags()
    }

    /// Replace the context flags; affects devices added from now on
    pub fn set_flags(&self, flags: ContextFlags) {
        *self.shared.flags.lock().unwrap() = flags;
    }

    /// Register a change callback; fires during event processing
    pub fn subscribe(
        &self,
        callback: impl FnMut(&DeviceEvent<B>) + Send + 'static,
    ) -> SubscriptionId {
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.shared.subscribers.lock().unwrap().list.push(Subscriber {
            id,
            callback: Box::new(callback),
        });
        id
    }

    /// Remove a subscription; takes effect after any dispatch in progress
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut set = self.shared.subscribers.lock().unwrap();
        let before = set.list.len();
        set.list.retain(|s| s.id != id);
        set.list.len() != before
    }

    /// Drain queued hotplug events and transfer completions
    ///
    /// All collection changes and subscriber callbacks happen here, on the
    /// calling thread.
    pub fn process_events(&self) {
        self.shared.process_pending();
    }

    /// Force a bus re-scan and diff it against the collection
    pub fn rescan(&self) {
        self.enumerate();
        self.shared.process_pending();
        self.shared.do_rescan();
    }

    /// Wait for a device to drop off the bus and reappear at the same port
    ///
    /// While the wait is pending the removal notification for this identity
    /// is withheld; if the identity never returns before `timeout`, the
    /// withheld removal is delivered and the wait fails with `TimedOut`.
    /// Only one wait per identity may be pending at a time.
    pub fn wait_for_replug(
        &self,
        device: &Arc<UsbDevice<B>>,
        timeout: Duration,
    ) -> Result<Arc<UsbDevice<B>>> {
        self.enumerate();
        let id = device.platform_id().clone();
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.replug.contains_key(&id) {
                return Err(UsbError::NotSupported(format!(
                    "a replug wait is already pending for {}",
                    id
                )));
            }
            state
                .replug
                .insert(id.clone(), ReplugWaiter::new(Arc::clone(device)));
        }
        info!("waiting for replug of {}", device.describe());

        let deadline = Instant::now() + timeout;
        self.shared.process_until(deadline, || {
            self.shared
                .state
                .lock()
                .unwrap()
                .replug
                .get(&id)
                .map(|w| w.is_resolved())
                .unwrap_or(true)
        });

        let waiter = self.shared.state.lock().unwrap().replug.remove(&id);
        let Some(waiter) = waiter else {
            return Err(UsbError::Internal(format!(
                "replug waiter for {} disappeared",
                id
            )));
        };
        let original = waiter.original().describe();
        let outcome = waiter.into_outcome();
        match outcome.replacement {
            Some(replacement) => {
                info!("{} reappeared as {}", original, replacement.describe());
                Ok(replacement)
            }
            None => {
                // deliver the removal we held back during the wait
                if let Some(removed) = outcome.removed {
                    if removed.announced.load(Ordering::SeqCst) {
                        self.shared.emit(&DeviceEvent::Removed(removed));
                    }
                }
                warn!("replug of {} timed out", original);
                Err(UsbError::TimedOut)
            }
        }
    }

    /// Device one hop up in the topology, if it is in the collection
    pub fn parent_of(&self, device: &UsbDevice<B>) -> Option<Arc<UsbDevice<B>>> {
        let ports = device.port_numbers();
        if ports.is_empty() {
            return None;
        }
        let parent_id = PlatformId::from_topology(device.bus_number(), &ports[..ports.len() - 1]);
        self.shared
            .state
            .lock()
            .unwrap()
            .devices
            .iter()
            .find(|d| d.platform_id() == &parent_id)
            .cloned()
    }

    /// Install a vendor/product name resolver; clears the name cache
    pub fn set_name_resolver(&self, resolver: Arc<dyn NameResolver>) {
        *self.shared.resolver.lock().unwrap() = Some(resolver);
        self.shared.names.lock().unwrap().clear();
    }

    pub fn vendor_name(&self, device: &UsbDevice<B>) -> Option<String> {
        self.resolve_names(device).0
    }

    pub fn product_name(&self, device: &UsbDevice<B>) -> Option<String> {
        self.resolve_names(device).1
    }

    /// Consult the resolver at most once per (vendor, product) pair
    fn resolve_names(&self, device: &UsbDevice<B>) -> (Option<String>, Option<String>) {
        let key = (device.vendor_id(), device.product_id());
        if let Some(hit) = self.shared.names.lock().unwrap().get(&key) {
            return hit.clone();
        }
        let resolver = self.shared.resolver.lock().unwrap().clone();
        let resolved = match resolver {
            Some(r) => (r.vendor_name(key.0), r.product_name(key.0, key.1)),
            None => (None, None),
        };
        self.shared
            .names
            .lock()
            .unwrap()
            .insert(key, resolved.clone());
        resolved
    }
}

impl<B: UsbBackend> Drop for DeviceContext<B> {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.shared.cmd_tx.send_blocking(PumpCommand::Shutdown);
        if let Some(pump) = self.pump.take() {
            if pump.join().is_err() {
                error!("event pump panicked during shutdown");
            }
        }
        self.shared.close_all();
        let outstanding = self.shared.scheduler.pending();
        if outstanding > 0 {
            warn!("context destroyed with {} transfers outstanding", outstanding);
        }
        debug!("device context destroyed");
    }
}

impl<B: UsbBackend> ContextShared<B> {
    pub(crate) fn flags(&self) -> ContextFlags {
        *self.flags.lock().unwrap()
    }

    /// Drain both event queues until empty
    pub(crate) fn process_pending(&self) {
        loop {
            let mut progressed = false;
            while let Ok(event) = self.backend_rx.try_recv() {
                progressed = true;
                match event {
                    BackendEvent::Arrived(raw) => self.handle_arrival(raw),
                    BackendEvent::Left(raw) => {
                        let bus = self.backend.bus_number(&raw);
                        let address = self.backend.address(&raw);
                        self.remove_by_key(bus, address);
                    }
                }
            }
            while let Ok(message) = self.event_rx.try_recv() {
                progressed = true;
                match message {
                    Marshal::Rescan => self.do_rescan(),
                    Marshal::TransferDone { id, result } => self.scheduler.complete(id, result),
                }
            }
            if !progressed {
                break;
            }
        }
    }

    /// Process events until `done` holds or `deadline` passes
    pub(crate) fn process_until(
        &self,
        deadline: Instant,
        mut done: impl FnMut() -> bool,
    ) -> bool {
        loop {
            self.process_pending();
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep((deadline - now).min(EVENT_STEP));
        }
    }

    /// Add a newly seen device to the collection
    ///
    /// Duplicate (bus, address) arrivals are ignored. A device whose
    /// descriptor cannot be read is skipped with a warning rather than
    /// failing the whole scan.
    fn handle_arrival(&self, raw: B::Device) {
        let bus = self.backend.bus_number(&raw);
        let address = self.backend.address(&raw);
        {
            let state = self.state.lock().unwrap();
            if state
                .devices
                .iter()
                .any(|d| d.bus_number() == bus && d.address() == address)
            {
                return;
            }
        }

        let device = match UsbDevice::from_raw(self.weak_self.clone(), &self.backend, raw) {
            Ok(device) => device.into_shared(),
            Err(e) => {
                warn!("skipping device on bus {:03} addr {:03}: {}", bus, address, e);
                return;
            }
        };

        {
            let mut state = self.state.lock().unwrap();
            if state
                .devices
                .iter()
                .any(|d| d.bus_number() == bus && d.address() == address)
            {
                return;
            }
            state.devices.push(Arc::clone(&device));
            if let Some(waiter) = state.replug.get_mut(device.platform_id()) {
                waiter.resolve(Arc::clone(&device));
            }
        }
        debug!("added {} ({})", device.describe(), device.platform_id());

        if self.flags().auto_open_devices {
            if let Err(e) = device.open_session() {
                warn!("auto-open of {} failed: {}", device.describe(), e);
            }
        }

        if self.enumerated.load(Ordering::SeqCst) {
            device.announced.store(true, Ordering::SeqCst);
            self.emit(&DeviceEvent::Added(device));
        }
    }

    /// Drop a device from the collection by its bus location
    pub(crate) fn remove_by_key(&self, bus: u8, address: u8) {
        let (device, suppressed) = {
            let mut state = self.state.lock().unwrap();
            let Some(pos) = state
                .devices
                .iter()
                .position(|d| d.bus_number() == bus && d.address() == address)
            else {
                return;
            };
            let device = state.devices.remove(pos);
            let suppressed = match state.replug.get_mut(device.platform_id()) {
                Some(waiter) => {
                    waiter.note_removed(Arc::clone(&device));
                    true
                }
                None => false,
            };
            (device, suppressed)
        };

        device.force_close();
        if suppressed {
            debug!(
                "removal of {} withheld for a pending replug wait",
                device.describe()
            );
        } else if device.announced.load(Ordering::SeqCst) {
            debug!("removed {}", device.describe());
            self.emit(&DeviceEvent::Removed(device));
        }
    }

    /// Scan the bus and reconcile the collection with what is live
    ///
    /// Emulated devices are never dropped by a scan; they exist only in the
    /// collection.
    pub(crate) fn do_rescan(&self) {
        let live = match self.backend.devices() {
            Ok(list) => list,
            Err(e) => {
                warn!("device scan failed: {}", e);
                return;
            }
        };
        let live_keys: HashSet<(u8, u8)> = live
            .iter()
            .map(|d| (self.backend.bus_number(d), self.backend.address(d)))
            .collect();

        let stale: Vec<(u8, u8)> = {
            let state = self.state.lock().unwrap();
            state
                .devices
                .iter()
                .filter(|d| {
                    !d.is_emulated() && !live_keys.contains(&(d.bus_number(), d.address()))
                })
                .map(|d| (d.bus_number(), d.address()))
                .collect()
        };
        for (bus, address) in stale {
            self.remove_by_key(bus, address);
        }
        for raw in live {
            self.handle_arrival(raw);
        }
    }

    /// Deliver an event to every subscriber
    ///
    /// The subscriber list is taken out for the duration of the dispatch so
    /// callbacks may call back into the context; subscriptions made from a
    /// callback start receiving events with the next dispatch. An emit from
    /// another thread waits for the dispatch in progress to finish, so no
    /// event ever sees the list while it is taken out.
    pub(crate) fn emit(&self, event: &DeviceEvent<B>) {
        let me = thread::current().id();
        let mut active = {
            let mut set = self.subscribers.lock().unwrap();
            while matches!(set.dispatcher, Some((owner, _)) if owner != me) {
                set = self.dispatch_idle.wait(set).unwrap();
            }
            match &mut set.dispatcher {
                Some((_, depth)) => *depth += 1,
                slot => *slot = Some((me, 1)),
            }
            std::mem::take(&mut set.list)
        };
        for subscriber in active.iter_mut() {
            (subscriber.callback)(event);
        }
        let mut set = self.subscribers.lock().unwrap();
        active.append(&mut set.list);
        set.list = active;
        if let Some((_, depth)) = &mut set.dispatcher {
            *depth -= 1;
            if *depth == 0 {
                set.dispatcher = None;
                self.dispatch_idle.notify_all();
            }
        }
    }

    /// Teardown: empty the collection and drop every open session
    pub(crate) fn close_all(&self) {
        let devices: Vec<_> = {
            let mut state = self.state.lock().unwrap();
            state.replug.clear();
            state.devices.drain(..).collect()
        };
        for device in &devices {
            device.force_close();
        }
    }
}
