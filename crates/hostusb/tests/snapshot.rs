//! Snapshot save/load against a live context: capture, emulated merge
//! semantics, and the add/change/remove diff on reload.

use hostusb::backend::mock::{MockBackend, MockDeviceBuilder, mock_interface};
use hostusb::{ContextFlags, DeviceContext, DeviceEvent, Snapshot, UsbError};
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    fn attach(&self, ctx: &DeviceContext<MockBackend>) {
        let log = Arc::clone(&self.0);
        ctx.subscribe(move |event| {
            let line = match event {
                DeviceEvent::Added(d) => format!("added {}", d.platform_id()),
                DeviceEvent::Removed(d) => format!("removed {}", d.platform_id()),
                DeviceEvent::Changed(d) => format!("changed {}", d.platform_id()),
            };
            log.lock().unwrap().push(line);
        });
    }

    fn lines(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

fn snapshot_with(ids: &[(&str, u16, u16)]) -> Snapshot {
    let devices = ids
        .iter()
        .map(|(id, vid, pid)| {
            format!(
                r#"{{"PlatformId": "{}", "IdVendor": {}, "IdProduct": {}}}"#,
                id, vid, pid
            )
        })
        .collect::<Vec<_>>()
        .join(",");
    Snapshot::from_json(&format!(r#"{{"UsbDevices": [{}]}}"#, devices)).unwrap()
}

#[test]
fn save_captures_the_enumerated_collection() {
    let backend = MockBackend::without_hotplug();
    backend.plug(
        MockDeviceBuilder::new(0x04f9, 0x2042)
            .bus(1)
            .address(4)
            .ports(&[2])
            .interface(mock_interface(0, 0x07, 0x01, 0x02))
            .build(),
    );
    let ctx = DeviceContext::new(backend, ContextFlags::default());

    let snapshot = ctx.save_snapshot();
    assert_eq!(snapshot.devices.len(), 1);
    let entry = &snapshot.devices[0];
    assert_eq!(entry.platform_id, "usb:01:02");
    assert_eq!(entry.id_vendor, 0x04f9);
    assert_eq!(entry.interfaces.len(), 1);
    assert_eq!(entry.interfaces[0].class, 0x07);
    assert_eq!(entry.interfaces[0].endpoints.len(), 1);
}

#[test]
fn load_adds_emulated_devices_once() {
    let backend = MockBackend::without_hotplug();
    let ctx = DeviceContext::new(backend, ContextFlags::default());
    let events = Recorder::default();
    events.attach(&ctx);

    let snapshot = snapshot_with(&[
        ("usb:01:04", 0x04f9, 0x2042),
        ("usb:01:05", 0x0bda, 0x8153),
    ]);

    ctx.load_snapshot(&snapshot);
    let devices = ctx.devices();
    assert_eq!(devices.len(), 2);
    assert!(devices.iter().all(|d| d.is_emulated()));
    assert_eq!(
        events.take(),
        vec!["added usb:01:04", "added usb:01:05"]
    );

    // loading the identical snapshot again replaces in place
    ctx.load_snapshot(&snapshot);
    assert_eq!(ctx.devices().len(), 2);
    assert_eq!(
        events.take(),
        vec!["changed usb:01:04", "changed usb:01:05"]
    );
}

#[test]
fn reload_with_different_identity_adds_and_removes() {
    let backend = MockBackend::without_hotplug();
    let ctx = DeviceContext::new(backend, ContextFlags::default());
    let events = Recorder::default();
    events.attach(&ctx);

    ctx.load_snapshot(&snapshot_with(&[("usb:01:04", 0x04f9, 0x2042)]));
    events.take();

    // same device recorded at a different port: new identity
    ctx.load_snapshot(&snapshot_with(&[("usb:01:05", 0x04f9, 0x2042)]));
    let devices = ctx.devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].platform_id().as_str(), "usb:01:05");

    let lines = events.lines();
    assert!(lines.contains(&"removed usb:01:04".to_string()));
    assert!(lines.contains(&"added usb:01:05".to_string()));
    assert_eq!(lines.len(), 2);
}

#[test]
fn emulated_devices_get_unique_addresses_on_bus_zero() {
    let backend = MockBackend::without_hotplug();
    backend.plug(MockDeviceBuilder::new(0x1234, 0x5678).bus(1).address(1).build());
    let ctx = DeviceContext::new(backend, ContextFlags::default());

    ctx.load_snapshot(&snapshot_with(&[
        ("usb:01:04", 0x04f9, 0x2042),
        ("usb:01:05", 0x0bda, 0x8153),
    ]));

    let devices = ctx.devices();
    assert_eq!(devices.len(), 3);
    let mut keys: Vec<(u8, u8)> = devices
        .iter()
        .map(|d| (d.bus_number(), d.address()))
        .collect();
    keys.sort_unstable();
    keys.dedup();
    assert_eq!(keys.len(), 3);
    assert!(devices.iter().filter(|d| d.is_emulated()).all(|d| d.bus_number() == 0));
}

#[test]
fn emulated_device_basic_session() {
    let backend = MockBackend::without_hotplug();
    let ctx = DeviceContext::new(backend, ContextFlags::default());
    ctx.load_snapshot(&snapshot_with(&[("usb:01:04", 0x04f9, 0x2042)]));

    let device = ctx.find_by_platform_id(&hostusb::PlatformId::from_string("usb:01:04")).unwrap();
    device.open().unwrap();
    assert!(device.is_open());
    assert!(matches!(
        device.string_descriptor(1),
        Err(UsbError::NotSupported(_))
    ));
    device.reset().unwrap();
    device.close().unwrap();
}

#[test]
fn snapshot_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("devices.json");

    let backend = MockBackend::without_hotplug();
    backend.plug(
        MockDeviceBuilder::new(0x04f9, 0x2042)
            .ports(&[2])
            .interface(mock_interface(0, 0x07, 0x01, 0x02))
            .build(),
    );
    let source = DeviceContext::new(backend, ContextFlags::default());
    source.save_snapshot_to(&path).unwrap();

    let target = DeviceContext::new(MockBackend::without_hotplug(), ContextFlags::default());
    target.load_snapshot_from(&path).unwrap();

    let devices = target.devices();
    assert_eq!(devices.len(), 1);
    assert!(devices[0].is_emulated());
    assert_eq!(devices[0].vendor_id(), 0x04f9);
    assert_eq!(devices[0].interfaces().unwrap().len(), 1);
}

#[test]
fn loading_a_bad_file_reports_io_or_parse_errors() {
    let ctx = DeviceContext::new(MockBackend::without_hotplug(), ContextFlags::default());
    assert!(matches!(
        ctx.load_snapshot_from("/nonexistent/devices.json"),
        Err(UsbError::Io(_))
    ));
    assert!(matches!(
        ctx.load_snapshot_json("{ not json"),
        Err(UsbError::Internal(_))
    ));
}
