//! In-memory backend double
//!
//! A scriptable [`UsbBackend`] used by the test suites (and usable by
//! downstream crates for their own tests). Devices are plugged and unplugged
//! programmatically; with hotplug enabled the double raises arrival/removal
//! events through the registered sink, without it the live list simply
//! changes so the polling fallback discovers the difference on rescan.

use crate::backend::{BackendEvent, HotplugGuard, UsbBackend, UsbSession};
use async_channel::Sender;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use types::{DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor, Result, Speed, UsbError};

/// Scriptable backend double
#[derive(Clone)]
pub struct MockBackend {
    inner: Arc<MockInner>,
}

struct MockInner {
    hotplug_capable: bool,
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    devices: Vec<MockDevice>,
    sink: Option<Sender<BackendEvent<MockDevice>>>,
}

impl MockBackend {
    /// Create a double that reports hotplug capability
    pub fn with_hotplug() -> Self {
        Self::new(true)
    }

    /// Create a double without hotplug, forcing the polling fallback
    pub fn without_hotplug() -> Self {
        Self::new(false)
    }

    fn new(hotplug_capable: bool) -> Self {
        MockBackend {
            inner: Arc::new(MockInner {
                hotplug_capable,
                state: Mutex::new(MockState::default()),
            }),
        }
    }

    /// Connect a simulated device
    ///
    /// Raises an arrival event when hotplug is enabled and registered.
    pub fn plug(&self, device: MockDevice) {
        let mut state = self.inner.state.lock().unwrap();
        state.devices.push(device.clone());
        if self.inner.hotplug_capable {
            if let Some(sink) = &state.sink {
                let _ = sink.send_blocking(BackendEvent::Arrived(device));
            }
        }
    }

    /// Disconnect a simulated device by bus and address
    pub fn unplug(&self, bus: u8, address: u8) -> Option<MockDevice> {
        let mut state = self.inner.state.lock().unwrap();
        let pos = state
            .devices
            .iter()
            .position(|d| d.spec.bus == bus && d.spec.address == address)?;
        let device = state.devices.remove(pos);
        if self.inner.hotplug_capable {
            if let Some(sink) = &state.sink {
                let _ = sink.send_blocking(BackendEvent::Left(device.clone()));
            }
        }
        Some(device)
    }

    /// Whether a hotplug sink is currently registered
    ///
    /// Registration happens on the event-pump thread shortly after a context
    /// starts; tests that rely on push-style events should wait for it.
    pub fn hotplug_registered(&self) -> bool {
        self.inner.state.lock().unwrap().sink.is_some()
    }
}

impl UsbBackend for MockBackend {
    type Device = MockDevice;

    fn devices(&self) -> Result<Vec<Self::Device>> {
        Ok(self.inner.state.lock().unwrap().devices.clone())
    }

    fn bus_number(&self, device: &Self::Device) -> u8 {
        device.spec.bus
    }

    fn address(&self, device: &Self::Device) -> u8 {
        device.spec.address
    }

    fn port_numbers(&self, device: &Self::Device) -> Vec<u8> {
        device.spec.ports.clone()
    }

    fn speed(&self, device: &Self::Device) -> Speed {
        device.spec.speed
    }

    fn device_descriptor(&self, device: &Self::Device) -> Result<DeviceDescriptor> {
        if device.spec.descriptor_fails {
            return Err(UsbError::Io("simulated descriptor read failure".to_string()));
        }
        Ok(device.spec.descriptor)
    }

    fn config_descriptor(&self, device: &Self::Device) -> Result<Vec<InterfaceDescriptor>> {
        Ok(device.spec.interfaces.clone())
    }

    fn open(&self, device: &Self::Device) -> Result<Box<dyn UsbSession>> {
        if let Some(err) = &device.spec.open_fails {
            return Err(err.clone());
        }
        Ok(Box::new(MockSession {
            spec: device.spec.clone(),
            configuration: 1,
            kernel_driver: device.spec.kernel_driver_interfaces.clone(),
        }))
    }

    fn has_hotplug(&self) -> bool {
        self.inner.hotplug_capable
    }

    fn register_hotplug(&self, sink: Sender<BackendEvent<Self::Device>>) -> Result<HotplugGuard> {
        if !self.inner.hotplug_capable {
            return Err(UsbError::NotSupported("hotplug not available".to_string()));
        }
        self.inner.state.lock().unwrap().sink = Some(sink);
        Ok(HotplugGuard::new(SinkGuard {
            inner: Arc::clone(&self.inner),
        }))
    }

    fn handle_events(&self, timeout: Duration) -> Result<()> {
        // Events are pushed straight into the sink by plug/unplug; nothing
        // to drive here beyond honoring a short bounded wait.
        std::thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(())
    }
}

/// Clears the hotplug sink when the pump thread drops its registration
struct SinkGuard {
    inner: Arc<MockInner>,
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        self.inner.state.lock().unwrap().sink = None;
    }
}

/// One simulated device
#[derive(Clone)]
pub struct MockDevice {
    spec: Arc<MockDeviceSpec>,
}

struct MockDeviceSpec {
    bus: u8,
    address: u8,
    ports: Vec<u8>,
    speed: Speed,
    descriptor: DeviceDescriptor,
    interfaces: Vec<InterfaceDescriptor>,
    strings: HashMap<u8, String>,
    open_fails: Option<UsbError>,
    descriptor_fails: bool,
    kernel_driver_interfaces: Vec<u8>,
}

/// Builder for simulated devices
pub struct MockDeviceBuilder {
    spec: MockDeviceSpec,
}

impl MockDeviceBuilder {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        MockDeviceBuilder {
            spec: MockDeviceSpec {
                bus: 1,
                address: 1,
                ports: vec![1],
                speed: Speed::High,
                descriptor: DeviceDescriptor {
                    vendor_id,
                    product_id,
                    class: 0,
                    subclass: 0,
                    protocol: 0,
                    bcd_device: 0x0100,
                    bcd_usb: 0x0200,
                    manufacturer_index: 0,
                    product_index: 0,
                    serial_index: 0,
                    num_configurations: 1,
                },
                interfaces: Vec::new(),
                strings: HashMap::new(),
                open_fails: None,
                descriptor_fails: false,
                kernel_driver_interfaces: Vec::new(),
            },
        }
    }

    pub fn bus(mut self, bus: u8) -> Self {
        self.spec.bus = bus;
        self
    }

    pub fn address(mut self, address: u8) -> Self {
        self.spec.address = address;
        self
    }

    /// Port chain from the root hub down to the device
    pub fn ports(mut self, ports: &[u8]) -> Self {
        self.spec.ports = ports.to_vec();
        self
    }

    pub fn speed(mut self, speed: Speed) -> Self {
        self.spec.speed = speed;
        self
    }

    pub fn class(mut self, class: u8, subclass: u8, protocol: u8) -> Self {
        self.spec.descriptor.class = class;
        self.spec.descriptor.subclass = subclass;
        self.spec.descriptor.protocol = protocol;
        self
    }

    pub fn string(mut self, index: u8, text: &str) -> Self {
        self.spec.strings.insert(index, text.to_string());
        self
    }

    pub fn interface(mut self, descriptor: InterfaceDescriptor) -> Self {
        self.spec.interfaces.push(descriptor);
        self
    }

    /// Fail every open attempt with the given error
    pub fn open_fails(mut self, err: UsbError) -> Self {
        self.spec.open_fails = Some(err);
        self
    }

    /// Fail the device-descriptor read, making the scan skip this device
    pub fn descriptor_fails(mut self) -> Self {
        self.spec.descriptor_fails = true;
        self
    }

    /// Mark interfaces as having an active kernel driver
    pub fn kernel_driver_on(mut self, interfaces: &[u8]) -> Self {
        self.spec.kernel_driver_interfaces = interfaces.to_vec();
        self
    }

    pub fn build(self) -> MockDevice {
        MockDevice {
            spec: Arc::new(self.spec),
        }
    }
}

/// Shorthand interface descriptor for mock devices
pub fn mock_interface(number: u8, class: u8, subclass: u8, protocol: u8) -> InterfaceDescriptor {
    InterfaceDescriptor {
        number,
        alternate_setting: 0,
        class,
        subclass,
        protocol,
        string_index: 0,
        endpoints: vec![EndpointDescriptor {
            address: 0x80 | (number + 1),
            attributes: 2,
            max_packet_size: 512,
            interval: 0,
            extra: Vec::new(),
        }],
        extra: Vec::new(),
    }
}

/// Simulated open session
///
/// Reads fill the buffer with an incrementing byte pattern; writes report
/// the full payload as transferred.
struct MockSession {
    spec: Arc<MockDeviceSpec>,
    configuration: u8,
    kernel_driver: Vec<u8>,
}

impl MockSession {
    fn fill_pattern(buf: &mut [u8]) -> usize {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = (i & 0xFF) as u8;
        }
        buf.len()
    }
}

impl UsbSession for MockSession {
    fn configuration(&mut self) -> Result<u8> {
        Ok(self.configuration)
    }

    fn set_configuration(&mut self, value: u8) -> Result<()> {
        self.configuration = value;
        Ok(())
    }

    fn claim_interface(&mut self, _number: u8) -> Result<()> {
        Ok(())
    }

    fn release_interface(&mut self, _number: u8) -> Result<()> {
        Ok(())
    }

    fn kernel_driver_active(&mut self, number: u8) -> Result<bool> {
        Ok(self.kernel_driver.contains(&number))
    }

    fn detach_kernel_driver(&mut self, number: u8) -> Result<()> {
        if self.kernel_driver.contains(&number) {
            self.kernel_driver.retain(|n| *n != number);
            Ok(())
        } else {
            Err(UsbError::NotFound("no kernel driver".to_string()))
        }
    }

    fn attach_kernel_driver(&mut self, number: u8) -> Result<()> {
        self.kernel_driver.push(number);
        Ok(())
    }

    fn set_alternate_setting(&mut self, _interface: u8, _alt: u8) -> Result<()> {
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_string_descriptor_ascii(&mut self, index: u8) -> Result<String> {
        self.spec
            .strings
            .get(&index)
            .cloned()
            .ok_or_else(|| UsbError::NotFound(format!("no string descriptor {}", index)))
    }

    fn read_string_descriptor(
        &mut self,
        index: u8,
        _lang_id: u16,
        max_length: usize,
    ) -> Result<Vec<u8>> {
        let text = self
            .spec
            .strings
            .get(&index)
            .ok_or_else(|| UsbError::NotFound(format!("no string descriptor {}", index)))?;
        // UTF-16LE payload prefixed with length and descriptor type, the way
        // a real device answers GET_DESCRIPTOR(String).
        let mut raw: Vec<u8> = Vec::with_capacity(2 + text.len() * 2);
        raw.push(0);
        raw.push(0x03);
        for unit in text.encode_utf16() {
            raw.extend_from_slice(&unit.to_le_bytes());
        }
        raw[0] = raw.len() as u8;
        raw.truncate(max_length);
        Ok(raw)
    }

    fn read_control(
        &mut self,
        _request_type: u8,
        _request: u8,
        _value: u16,
        _index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize> {
        Ok(Self::fill_pattern(buf))
    }

    fn write_control(
        &mut self,
        _request_type: u8,
        _request: u8,
        _value: u16,
        _index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize> {
        Ok(data.len())
    }

    fn read_bulk(&mut self, _endpoint: u8, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        Ok(Self::fill_pattern(buf))
    }

    fn write_bulk(&mut self, _endpoint: u8, data: &[u8], _timeout: Duration) -> Result<usize> {
        Ok(data.len())
    }

    fn read_interrupt(&mut self, _endpoint: u8, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        Ok(Self::fill_pattern(buf))
    }

    fn write_interrupt(&mut self, _endpoint: u8, data: &[u8], _timeout: Duration) -> Result<usize> {
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plug_and_list() {
        let backend = MockBackend::without_hotplug();
        backend.plug(MockDeviceBuilder::new(0x1234, 0x5678).build());
        assert_eq!(backend.devices().unwrap().len(), 1);
    }

    #[test]
    fn test_unplug_missing_device() {
        let backend = MockBackend::without_hotplug();
        assert!(backend.unplug(1, 1).is_none());
    }

    #[test]
    fn test_hotplug_events_reach_sink() {
        let backend = MockBackend::with_hotplug();
        let (tx, rx) = async_channel::unbounded();
        let _guard = backend.register_hotplug(tx).unwrap();

        backend.plug(MockDeviceBuilder::new(0x1234, 0x5678).address(3).build());
        match rx.try_recv().unwrap() {
            BackendEvent::Arrived(dev) => assert_eq!(dev.spec.address, 3),
            BackendEvent::Left(_) => panic!("expected an arrival event"),
        }

        backend.unplug(1, 3).unwrap();
        assert!(matches!(rx.try_recv().unwrap(), BackendEvent::Left(_)));
    }

    #[test]
    fn test_sink_cleared_on_guard_drop() {
        let backend = MockBackend::with_hotplug();
        let (tx, rx) = async_channel::unbounded();
        let guard = backend.register_hotplug(tx).unwrap();
        drop(guard);
        backend.plug(MockDeviceBuilder::new(0x1234, 0x5678).build());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_string_descriptor_round_trip() {
        let backend = MockBackend::without_hotplug();
        let device = MockDeviceBuilder::new(0x1234, 0x5678)
            .string(2, "Widget")
            .build();
        backend.plug(device.clone());
        let mut session = backend.open(&device).unwrap();
        assert_eq!(session.read_string_descriptor_ascii(2).unwrap(), "Widget");

        let raw = session.read_string_descriptor(2, 0x0409, 64).unwrap();
        assert_eq!(raw[1], 0x03);
        assert_eq!(raw.len(), 2 + "Widget".len() * 2);
    }
}
