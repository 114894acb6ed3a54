//! Host-controller binding capability
//!
//! The core never talks to libusb directly; it consumes the [`UsbBackend`]
//! trait, which wraps device enumeration primitives, descriptor retrieval,
//! session handling, transfer submission, and hotplug registration. The
//! production implementation sits on rusb; a scriptable in-memory double
//! lives in [`mock`].

pub mod mock;
pub mod rusb;

use async_channel::Sender;
use std::time::Duration;
use types::{DeviceDescriptor, InterfaceDescriptor, Result, Speed};

/// Hotplug notification raised by the binding
///
/// Delivered on whatever thread drives the binding's event loop; the context
/// marshals these onto the caller's event loop before touching any state.
#[derive(Debug, Clone)]
pub enum BackendEvent<D> {
    /// A device appeared on the bus
    Arrived(D),
    /// A device disappeared from the bus
    Left(D),
}

/// Low-level USB host-controller binding
///
/// `Device` is the binding's raw device reference; it must be cheap to clone
/// and safe to move across threads (rusb devices are ref-counted handles).
pub trait UsbBackend: Send + Sync + 'static {
    type Device: Clone + Send + Sync + 'static;

    /// Query the live device list
    fn devices(&self) -> Result<Vec<Self::Device>>;

    fn bus_number(&self, device: &Self::Device) -> u8;

    fn address(&self, device: &Self::Device) -> u8;

    /// Chain of port numbers from the root hub down to the device
    fn port_numbers(&self, device: &Self::Device) -> Vec<u8>;

    fn speed(&self, device: &Self::Device) -> Speed;

    /// Read the standard device descriptor
    fn device_descriptor(&self, device: &Self::Device) -> Result<DeviceDescriptor>;

    /// Parse the active configuration into interface descriptors
    fn config_descriptor(&self, device: &Self::Device) -> Result<Vec<InterfaceDescriptor>>;

    /// Open a device session for I/O
    fn open(&self, device: &Self::Device) -> Result<Box<dyn UsbSession>>;

    /// Whether the binding can deliver asynchronous hotplug notifications
    fn has_hotplug(&self) -> bool;

    /// Register a hotplug callback that forwards events into `sink`
    ///
    /// Called from the event-pump thread; the returned guard is held there
    /// for the thread's lifetime and deregisters the callback on drop.
    /// Events are raised from whichever thread is blocked in
    /// [`UsbBackend::handle_events`].
    fn register_hotplug(&self, sink: Sender<BackendEvent<Self::Device>>) -> Result<HotplugGuard>;

    /// Drive the binding's event loop for at most `timeout`
    fn handle_events(&self, timeout: Duration) -> Result<()>;
}

/// Opaque hotplug registration token
///
/// Not `Send`: rusb registrations are bound to the thread that drives the
/// event loop, so the guard never leaves the pump thread.
pub struct HotplugGuard(#[allow(dead_code)] Box<dyn std::any::Any>);

impl HotplugGuard {
    pub fn new(token: impl std::any::Any) -> Self {
        HotplugGuard(Box::new(token))
    }
}

/// An open device session
///
/// Object-safe so the device wrapper can hold it without knowing the backend
/// type. All blocking transfer primitives run on the event-pump thread.
pub trait UsbSession: Send {
    /// Currently active configuration value
    fn configuration(&mut self) -> Result<u8>;

    fn set_configuration(&mut self, value: u8) -> Result<()>;

    fn claim_interface(&mut self, number: u8) -> Result<()>;

    fn release_interface(&mut self, number: u8) -> Result<()>;

    fn kernel_driver_active(&mut self, number: u8) -> Result<bool>;

    fn detach_kernel_driver(&mut self, number: u8) -> Result<()>;

    fn attach_kernel_driver(&mut self, number: u8) -> Result<()>;

    fn set_alternate_setting(&mut self, interface: u8, alt: u8) -> Result<()>;

    fn reset(&mut self) -> Result<()>;

    fn read_string_descriptor_ascii(&mut self, index: u8) -> Result<String>;

    /// Raw (possibly UTF-16) string descriptor bytes, capped at `max_length`
    fn read_string_descriptor(
        &mut self,
        index: u8,
        lang_id: u16,
        max_length: usize,
    ) -> Result<Vec<u8>>;

    fn read_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize>;

    fn write_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize>;

    fn read_bulk(&mut self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    fn write_bulk(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize>;

    fn read_interrupt(&mut self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    fn write_interrupt(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize>;
}
