//! USB descriptor value types and identity
//!
//! These are plain data carriers: cached descriptor fields, parsed interface
//! and endpoint descriptors, and the topology-derived platform identity used
//! to recognize a physical device across unplug/replug cycles.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable per-topology device identity
///
/// Derived once from the bus number plus the chain of parent port numbers.
/// A device keeps the same platform id across unplug/replug at the same
/// physical port even though its bus address changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlatformId(String);

impl PlatformId {
    /// Derive a platform id from USB topology
    ///
    /// `ports` is the chain of port numbers from the root hub down to the
    /// device. Format: `usb:BB:PP:PP...` with two-digit zero-padded decimal
    /// components.
    pub fn from_topology(bus: u8, ports: &[u8]) -> Self {
        let mut id = format!("usb:{:02}", bus);
        for port in ports {
            id.push_str(&format!(":{:02}", port));
        }
        PlatformId(id)
    }

    /// Wrap an already-formatted platform id (snapshot load path)
    pub fn from_string(id: impl Into<String>) -> Self {
        PlatformId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cached device descriptor fields
///
/// Read once from the backend when the device is first seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// USB device class
    pub class: u8,
    /// USB device subclass
    pub subclass: u8,
    /// USB device protocol
    pub protocol: u8,
    /// Device release number (BCD)
    pub bcd_device: u16,
    /// USB specification release number (BCD)
    pub bcd_usb: u16,
    /// Manufacturer string descriptor index (0 = none)
    pub manufacturer_index: u8,
    /// Product string descriptor index (0 = none)
    pub product_index: u8,
    /// Serial number string descriptor index (0 = none)
    pub serial_index: u8,
    /// Number of configurations
    pub num_configurations: u8,
}

/// USB device speed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Speed {
    /// Speed not known to the backend
    Unknown,
    /// Low speed - 1.5 Mbps
    Low,
    /// Full speed - 12 Mbps
    Full,
    /// High speed - 480 Mbps
    High,
    /// SuperSpeed - 5 Gbps
    Super,
    /// SuperSpeed+ - 10 Gbps
    SuperPlus,
}

/// Parsed interface descriptor (immutable value object)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub alternate_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    /// Interface string descriptor index (0 = none)
    pub string_index: u8,
    pub endpoints: Vec<EndpointDescriptor>,
    /// Class-specific descriptor bytes following the interface descriptor
    pub extra: Vec<u8>,
}

impl InterfaceDescriptor {
    /// Whether this interface matches a class/subclass/protocol triple
    pub fn matches(&self, class: u8, subclass: u8, protocol: u8) -> bool {
        self.class == class && self.subclass == subclass && self.protocol == protocol
    }
}

/// Parsed endpoint descriptor (immutable value object)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// Endpoint address including the direction bit
    pub address: u8,
    /// bmAttributes (transfer type in the low bits)
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
    /// Class-specific descriptor bytes following the endpoint descriptor
    pub extra: Vec<u8>,
}

/// Context-wide configuration flags
///
/// Passed at construction and adjustable afterwards; replaces any ambient
/// per-process debug state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextFlags {
    /// Open every device immediately when it is added to the collection.
    /// Explicit open/close calls on such devices become no-op successes.
    pub auto_open_devices: bool,
}

/// Flags for interface claim/release
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClaimFlags {
    /// Detach any kernel driver before claiming and reattach it after
    /// releasing, tolerating not-found/not-supported/busy outcomes.
    pub bind_kernel_driver: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_id_format() {
        let id = PlatformId::from_topology(2, &[3, 1]);
        assert_eq!(id.as_str(), "usb:02:03:01");
    }

    #[test]
    fn test_platform_id_root_device() {
        let id = PlatformId::from_topology(1, &[]);
        assert_eq!(id.as_str(), "usb:01");
    }

    #[test]
    fn test_platform_id_stable_across_recompute() {
        let a = PlatformId::from_topology(1, &[4, 2]);
        let b = PlatformId::from_topology(1, &[4, 2]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_interface_matches() {
        let iface = InterfaceDescriptor {
            number: 0,
            alternate_setting: 0,
            class: 0xFF,
            subclass: 0x47,
            protocol: 0x11,
            string_index: 4,
            endpoints: Vec::new(),
            extra: Vec::new(),
        };
        assert!(iface.matches(0xFF, 0x47, 0x11));
        assert!(!iface.matches(0xFF, 0x47, 0x12));
    }
}
