//! Snapshot save/load and replay
//!
//! Saving captures the enumerated collection into the JSON snapshot format;
//! loading materializes emulated devices from one. Loaded devices join the
//! live collection on bus 0 and answer recorded control transfers by
//! signature lookup.

use crate::backend::UsbBackend;
use crate::context::{DeviceContext, DeviceEvent};
use crate::device::UsbDevice;
use crate::transfers::{DEFAULT_CONTROL_IN, TransferKind, TransferOutcome};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};
use types::{
    DeviceSnapshot, EndpointDescriptor, EndpointSnapshot, InterfaceDescriptor, InterfaceSnapshot,
    PlatformId, Result, Snapshot, UsbError,
};

impl<B: UsbBackend> DeviceContext<B> {
    /// Capture the current collection as a snapshot
    pub fn save_snapshot(&self) -> Snapshot {
        let devices = self.devices();
        Snapshot {
            devices: devices.iter().map(|d| d.to_snapshot()).collect(),
        }
    }

    /// Capture the current collection as pretty-printed JSON
    pub fn save_snapshot_json(&self) -> Result<String> {
        self.save_snapshot().to_json()
    }

    /// Write the current collection to a snapshot file
    pub fn save_snapshot_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = self.save_snapshot_json()?;
        std::fs::write(path.as_ref(), json)
            .map_err(|e| UsbError::Io(format!("writing snapshot: {}", e)))
    }

    /// Merge a snapshot into the collection as emulated devices
    ///
    /// Entries with a platform id not present yet are added; entries whose
    /// id matches an existing emulated device replace it and raise a Changed
    /// event. Previously loaded emulated devices absent from this snapshot
    /// are removed. Physical devices are never touched.
    pub fn load_snapshot(&self, snapshot: &Snapshot) {
        self.enumerate();

        let mut added = Vec::new();
        let mut changed = Vec::new();
        let mut seen: HashSet<PlatformId> = HashSet::new();
        let auto_open = self.flags().auto_open_devices;
        {
            let mut state = self.shared.state.lock().unwrap();
            for snap in &snapshot.devices {
                let id = PlatformId::from_string(&snap.platform_id);
                seen.insert(id.clone());
                match state.devices.iter().position(|d| d.platform_id() == &id) {
                    Some(pos) if state.devices[pos].is_emulated() => {
                        let address = state.devices[pos].address();
                        let device =
                            UsbDevice::from_snapshot(self.shared.weak_self.clone(), snap, address)
                                .into_shared();
                        device.announced.store(true, Ordering::SeqCst);
                        state.devices[pos] = Arc::clone(&device);
                        changed.push(device);
                    }
                    Some(_) => {
                        warn!(
                            "snapshot entry {} collides with a physical device, skipped",
                            id
                        );
                    }
                    None => {
                        let address = state.next_emulated_address;
                        state.next_emulated_address = state.next_emulated_address.wrapping_add(1);
                        let device =
                            UsbDevice::from_snapshot(self.shared.weak_self.clone(), snap, address)
                                .into_shared();
                        device.announced.store(true, Ordering::SeqCst);
                        state.devices.push(Arc::clone(&device));
                        added.push(device);
                    }
                }
            }
        }

        let stale: Vec<(u8, u8)> = {
            let state = self.shared.state.lock().unwrap();
            state
                .devices
                .iter()
                .filter(|d| d.is_emulated() && !seen.contains(d.platform_id()))
                .map(|d| (d.bus_number(), d.address()))
                .collect()
        };
        for (bus, address) in stale {
            self.shared.remove_by_key(bus, address);
        }

        info!(
            "snapshot loaded: {} added, {} changed",
            added.len(),
            changed.len()
        );
        for device in added {
            if auto_open {
                if let Err(e) = device.open_session() {
                    warn!("auto-open of {} failed: {}", device.describe(), e);
                }
            }
            self.shared.emit(&DeviceEvent::Added(device));
        }
        for device in changed {
            if auto_open {
                if let Err(e) = device.open_session() {
                    warn!("auto-open of {} failed: {}", device.describe(), e);
                }
            }
            self.shared.emit(&DeviceEvent::Changed(device));
        }
    }

    /// Parse JSON snapshot text and merge it into the collection
    pub fn load_snapshot_json(&self, json: &str) -> Result<()> {
        let snapshot = Snapshot::from_json(json)?;
        self.load_snapshot(&snapshot);
        Ok(())
    }

    /// Read and merge a snapshot file
    pub fn load_snapshot_from(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = std::fs::read_to_string(path.as_ref())
            .map_err(|e| UsbError::Io(format!("reading snapshot: {}", e)))?;
        self.load_snapshot_json(&json)
    }
}

pub(crate) fn interface_from_snapshot(snap: &InterfaceSnapshot) -> InterfaceDescriptor {
    InterfaceDescriptor {
        number: snap.number,
        alternate_setting: snap.alternate_setting,
        class: snap.class,
        subclass: snap.subclass,
        protocol: snap.protocol,
        string_index: snap.string_index,
        endpoints: snap
            .endpoints
            .iter()
            .map(|ep| EndpointDescriptor {
                address: ep.address,
                attributes: ep.attributes,
                max_packet_size: ep.max_packet_size,
                interval: ep.interval,
                extra: ep.extra.clone(),
            })
            .collect(),
        extra: snap.extra.clone(),
    }
}

pub(crate) fn interface_to_snapshot(desc: &InterfaceDescriptor) -> InterfaceSnapshot {
    InterfaceSnapshot {
        descriptor_type: 0x04,
        number: desc.number,
        alternate_setting: desc.alternate_setting,
        class: desc.class,
        subclass: desc.subclass,
        protocol: desc.protocol,
        string_index: desc.string_index,
        endpoints: desc
            .endpoints
            .iter()
            .map(|ep| EndpointSnapshot {
                descriptor_type: 0x05,
                address: ep.address,
                attributes: ep.attributes,
                max_packet_size: ep.max_packet_size,
                interval: ep.interval,
                extra: ep.extra.clone(),
            })
            .collect(),
        extra: desc.extra.clone(),
    }
}

/// Answer a transfer from a snapshot's recorded exchanges
///
/// Only control transfers can be replayed; the request setup is formatted
/// into the same signature the recorder used and looked up in the event
/// list.
pub(crate) fn replay_transfer(
    snap: &DeviceSnapshot,
    kind: &TransferKind,
) -> Result<TransferOutcome> {
    let TransferKind::Control {
        request_type,
        request,
        value,
        index,
        data,
    } = kind
    else {
        return Err(UsbError::NotSupported(
            "emulated devices replay control transfers only".to_string(),
        ));
    };

    let is_in = (request_type & 0x80) != 0;
    let length = if is_in && data.is_empty() {
        DEFAULT_CONTROL_IN
    } else {
        data.len()
    };
    let id = control_event_id(*request_type, *request, *value, *index, length);

    let Some(event) = snap.events.iter().find(|e| e.id == id) else {
        debug!("no recorded exchange {} on {}", id, snap.platform_id);
        return Err(UsbError::NotSupported(format!(
            "no recorded exchange for {}",
            id
        )));
    };
    if event.status != 0 {
        return Err(UsbError::TransferFailed(format!(
            "recorded exchange {} failed with status {}",
            id, event.status
        )));
    }
    let actual = if event.data.is_empty() {
        event.rc.max(0) as usize
    } else {
        event.data.len()
    };
    Ok(TransferOutcome {
        actual,
        data: event.data.clone(),
    })
}

/// Control-transfer signature: request type, request, wValue, wIndex and
/// length, all lowercase hex
pub(crate) fn control_event_id(
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: usize,
) -> String {
    format!(
        "{:02x}:{:02x}:{:04x}:{:04x}:{:04x}",
        request_type, request, value, index, length
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::IoEventSnapshot;

    fn recorded_device() -> DeviceSnapshot {
        DeviceSnapshot {
            platform_id: "usb:01:04".to_string(),
            created: 0,
            tags: Vec::new(),
            id_vendor: 0x04f9,
            id_product: 0x2042,
            device_bcd: 0,
            usb_bcd: 0x0200,
            manufacturer_index: 0,
            product_index: 0,
            interfaces: Vec::new(),
            events: vec![
                IoEventSnapshot {
                    id: "c0:33:0000:0000:0004".to_string(),
                    status: 0,
                    rc: 4,
                    data: vec![0xAA, 0xBB, 0xCC, 0xDD],
                },
                IoEventSnapshot {
                    id: "40:34:0001:0000:0002".to_string(),
                    status: 0,
                    rc: 2,
                    data: Vec::new(),
                },
                IoEventSnapshot {
                    id: "c0:35:0000:0000:0004".to_string(),
                    status: -9,
                    rc: -9,
                    data: Vec::new(),
                },
            ],
        }
    }

    #[test]
    fn test_replay_control_in() {
        let snap = recorded_device();
        let outcome = replay_transfer(
            &snap,
            &TransferKind::Control {
                request_type: 0xC0,
                request: 0x33,
                value: 0,
                index: 0,
                data: vec![0; 4],
            },
        )
        .unwrap();
        assert_eq!(outcome.data, vec![0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(outcome.actual, 4);
    }

    #[test]
    fn test_replay_control_out_reports_rc() {
        let snap = recorded_device();
        let outcome = replay_transfer(
            &snap,
            &TransferKind::Control {
                request_type: 0x40,
                request: 0x34,
                value: 1,
                index: 0,
                data: vec![1, 2],
            },
        )
        .unwrap();
        assert_eq!(outcome.actual, 2);
        assert!(outcome.data.is_empty());
    }

    #[test]
    fn test_replay_recorded_failure() {
        let snap = recorded_device();
        let err = replay_transfer(
            &snap,
            &TransferKind::Control {
                request_type: 0xC0,
                request: 0x35,
                value: 0,
                index: 0,
                data: vec![0; 4],
            },
        )
        .unwrap_err();
        assert!(matches!(err, UsbError::TransferFailed(_)));
    }

    #[test]
    fn test_replay_unknown_exchange() {
        let snap = recorded_device();
        let err = replay_transfer(
            &snap,
            &TransferKind::Control {
                request_type: 0xC0,
                request: 0x77,
                value: 0,
                index: 0,
                data: vec![0; 4],
            },
        )
        .unwrap_err();
        assert!(matches!(err, UsbError::NotSupported(_)));
    }

    #[test]
    fn test_replay_rejects_bulk() {
        let snap = recorded_device();
        let err = replay_transfer(
            &snap,
            &TransferKind::Bulk {
                endpoint: 0x81,
                data: vec![0; 8],
            },
        )
        .unwrap_err();
        assert!(matches!(err, UsbError::NotSupported(_)));
    }

    #[test]
    fn test_interface_conversion_round_trip() {
        let desc = InterfaceDescriptor {
            number: 1,
            alternate_setting: 0,
            class: 0x07,
            subclass: 0x01,
            protocol: 0x02,
            string_index: 3,
            endpoints: vec![EndpointDescriptor {
                address: 0x02,
                attributes: 0x02,
                max_packet_size: 64,
                interval: 0,
                extra: vec![9, 9],
            }],
            extra: vec![1, 2, 3],
        };
        let round = interface_from_snapshot(&interface_to_snapshot(&desc));
        assert_eq!(round, desc);
    }
}
