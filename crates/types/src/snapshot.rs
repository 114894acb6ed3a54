//! JSON device snapshot format
//!
//! A snapshot records enumerated device state (identity, descriptor fields,
//! interface/endpoint layout) plus optional recorded I/O events, and is used
//! for device emulation and replay. Binary payloads are base64-encoded
//! strings in the JSON form.

use crate::error::{Result, UsbError};
use serde::{Deserialize, Serialize};

/// Top-level snapshot document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "UsbDevices", default)]
    pub devices: Vec<DeviceSnapshot>,
}

impl Snapshot {
    /// Parse a snapshot from its JSON text form
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| UsbError::Internal(format!("bad snapshot: {}", e)))
    }

    /// Serialize the snapshot to pretty-printed JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| UsbError::Internal(format!("snapshot encode: {}", e)))
    }
}

/// One recorded device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    #[serde(rename = "PlatformId")]
    pub platform_id: String,
    /// Creation time, seconds since the Unix epoch
    #[serde(rename = "Created", default)]
    pub created: u64,
    #[serde(rename = "Tags", default)]
    pub tags: Vec<String>,
    #[serde(rename = "IdVendor")]
    pub id_vendor: u16,
    #[serde(rename = "IdProduct")]
    pub id_product: u16,
    #[serde(rename = "Device", default)]
    pub device_bcd: u16,
    #[serde(rename = "USB", default)]
    pub usb_bcd: u16,
    #[serde(rename = "Manufacturer", default)]
    pub manufacturer_index: u8,
    #[serde(rename = "Product", default)]
    pub product_index: u8,
    #[serde(rename = "UsbInterfaces", default)]
    pub interfaces: Vec<InterfaceSnapshot>,
    #[serde(rename = "UsbEvents", default)]
    pub events: Vec<IoEventSnapshot>,
}

/// Recorded interface descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceSnapshot {
    #[serde(rename = "DescriptorType", default = "interface_descriptor_type")]
    pub descriptor_type: u8,
    #[serde(rename = "InterfaceNumber")]
    pub number: u8,
    #[serde(rename = "AlternateSetting", default)]
    pub alternate_setting: u8,
    #[serde(rename = "Class")]
    pub class: u8,
    #[serde(rename = "SubClass")]
    pub subclass: u8,
    #[serde(rename = "Protocol")]
    pub protocol: u8,
    #[serde(rename = "Interface", default)]
    pub string_index: u8,
    #[serde(rename = "UsbEndpoints", default)]
    pub endpoints: Vec<EndpointSnapshot>,
    /// Class-specific bytes, base64
    #[serde(rename = "ExtraData", default, with = "base64_bytes")]
    pub extra: Vec<u8>,
}

/// Recorded endpoint descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointSnapshot {
    #[serde(rename = "DescriptorType", default = "endpoint_descriptor_type")]
    pub descriptor_type: u8,
    #[serde(rename = "EndpointAddress")]
    pub address: u8,
    #[serde(rename = "Attributes", default)]
    pub attributes: u8,
    #[serde(rename = "MaxPacketSize", default)]
    pub max_packet_size: u16,
    #[serde(rename = "Interval", default)]
    pub interval: u8,
    /// Class-specific bytes, base64
    #[serde(rename = "ExtraData", default, with = "base64_bytes")]
    pub extra: Vec<u8>,
}

/// One recorded I/O exchange, keyed by a request signature string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoEventSnapshot {
    /// Request signature, e.g. a formatted control-transfer setup
    #[serde(rename = "Id")]
    pub id: String,
    /// Completion status of the recorded exchange
    #[serde(rename = "Status", default)]
    pub status: i32,
    /// Raw backend return code
    #[serde(rename = "Rc", default)]
    pub rc: i32,
    /// Response payload, base64
    #[serde(rename = "Data", default, with = "base64_bytes")]
    pub data: Vec<u8>,
}

fn interface_descriptor_type() -> u8 {
    0x04
}

fn endpoint_descriptor_type() -> u8 {
    0x05
}

/// Serde adapter: `Vec<u8>` as a base64 string
mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(de)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_device() -> DeviceSnapshot {
        DeviceSnapshot {
            platform_id: "usb:01:02".to_string(),
            created: 1_700_000_000,
            tags: vec!["emulation".to_string()],
            id_vendor: 0x04f9,
            id_product: 0x2042,
            device_bcd: 0x0100,
            usb_bcd: 0x0200,
            manufacturer_index: 1,
            product_index: 2,
            interfaces: vec![InterfaceSnapshot {
                descriptor_type: 0x04,
                number: 0,
                alternate_setting: 0,
                class: 0x07,
                subclass: 0x01,
                protocol: 0x02,
                string_index: 0,
                endpoints: vec![EndpointSnapshot {
                    descriptor_type: 0x05,
                    address: 0x81,
                    attributes: 0x02,
                    max_packet_size: 512,
                    interval: 0,
                    extra: vec![0xDE, 0xAD],
                }],
                extra: Vec::new(),
            }],
            events: vec![IoEventSnapshot {
                id: "c0:01:0000:0000:0004".to_string(),
                status: 0,
                rc: 4,
                data: vec![1, 2, 3, 4],
            }],
        }
    }

    #[test]
    fn test_snapshot_json_round_trip() {
        let snapshot = Snapshot {
            devices: vec![sample_device()],
        };
        let json = snapshot.to_json().unwrap();
        let parsed = Snapshot::from_json(&json).unwrap();
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn test_extra_bytes_are_base64_strings() {
        let snapshot = Snapshot {
            devices: vec![sample_device()],
        };
        let json = snapshot.to_json().unwrap();
        // 0xDE 0xAD encodes to "3q0="
        assert!(json.contains("3q0="));
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let json = r#"{
            "UsbDevices": [{
                "PlatformId": "usb:01:05",
                "IdVendor": 4660,
                "IdProduct": 22136
            }]
        }"#;
        let parsed = Snapshot::from_json(json).unwrap();
        assert_eq!(parsed.devices.len(), 1);
        assert_eq!(parsed.devices[0].id_vendor, 0x1234);
        assert!(parsed.devices[0].interfaces.is_empty());
        assert!(parsed.devices[0].events.is_empty());
    }

    #[test]
    fn test_bad_json_is_internal_error() {
        let err = Snapshot::from_json("{ not json").unwrap_err();
        assert!(matches!(err, crate::UsbError::Internal(_)));
    }
}
