//! Shared type definitions for hostusb
//!
//! This crate holds the pieces of the public surface that carry no logic:
//! the error taxonomy, descriptor value types, the stable platform identity,
//! context/claim flag structs, and the JSON device snapshot format.

pub mod error;
pub mod snapshot;
pub mod types;

pub use error::{Result, UsbError};
pub use snapshot::{DeviceSnapshot, EndpointSnapshot, InterfaceSnapshot, IoEventSnapshot, Snapshot};
pub use types::{
    ClaimFlags, ContextFlags, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor,
    PlatformId, Speed,
};
