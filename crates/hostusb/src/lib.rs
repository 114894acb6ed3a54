//! Host-side USB access layer
//!
//! A thread-safe view of the host's USB devices: enumeration, hotplug
//! tracking, descriptor access, and synchronous/asynchronous transfers on
//! top of a pluggable host-controller binding. The production binding sits
//! on rusb; a scriptable in-memory binding backs the tests.
//!
//! The threading contract is deliberate: the backend's event loop runs on a
//! dedicated pump thread, but every collection change and subscriber
//! callback happens on the thread that calls
//! [`DeviceContext::process_events`] (or one of the blocking waits that
//! drive it internally).
//!
//! ```no_run
//! use hostusb::{ContextFlags, DeviceContext};
//!
//! # fn main() -> hostusb::Result<()> {
//! let ctx = DeviceContext::new_system(ContextFlags::default())?;
//! for device in ctx.devices() {
//!     println!("{:04x}:{:04x}", device.vendor_id(), device.product_id());
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod context;
pub mod device;
pub mod logging;
pub mod names;
mod pump;
mod replug;
mod snapshot;
pub mod transfers;

pub use backend::rusb::RusbBackend;
pub use backend::{BackendEvent, HotplugGuard, UsbBackend, UsbSession};
pub use context::{DeviceContext, DeviceEvent, SubscriptionId};
pub use device::UsbDevice;
pub use logging::setup_logging;
pub use names::{NameResolver, StaticNames};
pub use transfers::{CancelHandle, TransferCallback, TransferOutcome, TransferTicket};
pub use types::{
    ClaimFlags, ContextFlags, DeviceDescriptor, DeviceSnapshot, EndpointDescriptor,
    InterfaceDescriptor, PlatformId, Result, Snapshot, Speed, UsbError,
};
