//! rusb-backed host-controller binding
//!
//! Production [`UsbBackend`] implementation over `rusb`/libusb. Raw result
//! codes are translated into the [`UsbError`] taxonomy here and never leak
//! past this module.

use crate::backend::{BackendEvent, HotplugGuard, UsbBackend, UsbSession};
use async_channel::Sender;
use rusb::{Context, Device, Hotplug, HotplugBuilder, UsbContext};
use std::time::Duration;
use tracing::debug;
use types::{
    DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor, Result, Speed, UsbError,
};

/// Timeout for string-descriptor control reads
const STRING_TIMEOUT: Duration = Duration::from_secs(1);

/// USB backend over a libusb context
pub struct RusbBackend {
    context: Context,
}

impl RusbBackend {
    /// Open the libusb binding; fails if the host session cannot initialize
    pub fn new() -> Result<Self> {
        let context = Context::new().map_err(map_rusb_error)?;
        Ok(Self { context })
    }
}

impl UsbBackend for RusbBackend {
    type Device = Device<Context>;

    fn devices(&self) -> Result<Vec<Self::Device>> {
        let list = self.context.devices().map_err(map_rusb_error)?;
        Ok(list.iter().collect())
    }

    fn bus_number(&self, device: &Self::Device) -> u8 {
        device.bus_number()
    }

    fn address(&self, device: &Self::Device) -> u8 {
        device.address()
    }

    fn port_numbers(&self, device: &Self::Device) -> Vec<u8> {
        device.port_numbers().unwrap_or_default()
    }

    fn speed(&self, device: &Self::Device) -> Speed {
        match device.speed() {
            rusb::Speed::Low => Speed::Low,
            rusb::Speed::Full => Speed::Full,
            rusb::Speed::High => Speed::High,
            rusb::Speed::Super => Speed::Super,
            rusb::Speed::SuperPlus => Speed::SuperPlus,
            _ => Speed::Unknown,
        }
    }

    fn device_descriptor(&self, device: &Self::Device) -> Result<DeviceDescriptor> {
        let desc = device.device_descriptor().map_err(map_rusb_error)?;
        Ok(DeviceDescriptor {
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            class: desc.class_code(),
            subclass: desc.sub_class_code(),
            protocol: desc.protocol_code(),
            bcd_device: version_to_bcd(desc.device_version()),
            bcd_usb: version_to_bcd(desc.usb_version()),
            manufacturer_index: desc.manufacturer_string_index().unwrap_or(0),
            product_index: desc.product_string_index().unwrap_or(0),
            serial_index: desc.serial_number_string_index().unwrap_or(0),
            num_configurations: desc.num_configurations(),
        })
    }

    fn config_descriptor(&self, device: &Self::Device) -> Result<Vec<InterfaceDescriptor>> {
        let config = device
            .active_config_descriptor()
            .or_else(|_| device.config_descriptor(0))
            .map_err(map_rusb_error)?;

        let mut interfaces = Vec::new();
        for interface in config.interfaces() {
            for desc in interface.descriptors() {
                let endpoints = desc
                    .endpoint_descriptors()
                    .map(|ep| EndpointDescriptor {
                        address: ep.address(),
                        attributes: transfer_type_bits(ep.transfer_type()),
                        max_packet_size: ep.max_packet_size(),
                        interval: ep.interval(),
                        extra: Vec::new(),
                    })
                    .collect();
                interfaces.push(InterfaceDescriptor {
                    number: desc.interface_number(),
                    alternate_setting: desc.setting_number(),
                    class: desc.class_code(),
                    subclass: desc.sub_class_code(),
                    protocol: desc.protocol_code(),
                    string_index: desc.description_string_index().unwrap_or(0),
                    endpoints,
                    extra: Vec::new(),
                });
            }
        }
        Ok(interfaces)
    }

    fn open(&self, device: &Self::Device) -> Result<Box<dyn UsbSession>> {
        let handle = device.open().map_err(map_rusb_error)?;
        Ok(Box::new(RusbSession { handle }))
    }

    fn has_hotplug(&self) -> bool {
        rusb::has_hotplug()
    }

    fn register_hotplug(&self, sink: Sender<BackendEvent<Self::Device>>) -> Result<HotplugGuard> {
        let registration = HotplugBuilder::new()
            .enumerate(false)
            .register(&self.context, Box::new(HotplugForwarder { sink }))
            .map_err(map_rusb_error)?;
        debug!("hotplug callback registered");
        Ok(HotplugGuard::new(registration))
    }

    fn handle_events(&self, timeout: Duration) -> Result<()> {
        self.context
            .handle_events(Some(timeout))
            .map_err(map_rusb_error)
    }
}

/// Forwards libusb hotplug callbacks into the context's marshal channel
///
/// The callback fires on the thread driving `handle_events`; it never
/// touches the device collection, it only enqueues.
struct HotplugForwarder {
    sink: Sender<BackendEvent<Device<Context>>>,
}

impl Hotplug<Context> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            "hotplug: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.sink.send_blocking(BackendEvent::Arrived(device));
    }

    fn device_left(&mut self, device: Device<Context>) {
        debug!(
            "hotplug: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.sink.send_blocking(BackendEvent::Left(device));
    }
}

/// Open rusb device session
struct RusbSession {
    handle: rusb::DeviceHandle<Context>,
}

impl UsbSession for RusbSession {
    fn configuration(&mut self) -> Result<u8> {
        self.handle.active_configuration().map_err(map_rusb_error)
    }

    fn set_configuration(&mut self, value: u8) -> Result<()> {
        self.handle
            .set_active_configuration(value)
            .map_err(map_rusb_error)
    }

    fn claim_interface(&mut self, number: u8) -> Result<()> {
        self.handle.claim_interface(number).map_err(map_rusb_error)
    }

    fn release_interface(&mut self, number: u8) -> Result<()> {
        self.handle
            .release_interface(number)
            .map_err(map_rusb_error)
    }

    fn kernel_driver_active(&mut self, number: u8) -> Result<bool> {
        self.handle
            .kernel_driver_active(number)
            .map_err(map_rusb_error)
    }

    fn detach_kernel_driver(&mut self, number: u8) -> Result<()> {
        self.handle
            .detach_kernel_driver(number)
            .map_err(map_rusb_error)
    }

    fn attach_kernel_driver(&mut self, number: u8) -> Result<()> {
        self.handle
            .attach_kernel_driver(number)
            .map_err(map_rusb_error)
    }

    fn set_alternate_setting(&mut self, interface: u8, alt: u8) -> Result<()> {
        self.handle
            .set_alternate_setting(interface, alt)
            .map_err(map_rusb_error)
    }

    fn reset(&mut self) -> Result<()> {
        self.handle.reset().map_err(map_rusb_error)
    }

    fn read_string_descriptor_ascii(&mut self, index: u8) -> Result<String> {
        self.handle
            .read_string_descriptor_ascii(index)
            .map_err(map_rusb_error)
    }

    fn read_string_descriptor(
        &mut self,
        index: u8,
        lang_id: u16,
        max_length: usize,
    ) -> Result<Vec<u8>> {
        // GET_DESCRIPTOR(String) control read; the raw UTF-16 payload is
        // returned untouched.
        let mut buf = vec![0u8; max_length.min(255)];
        let len = self
            .handle
            .read_control(
                0x80,
                0x06,
                0x0300 | u16::from(index),
                lang_id,
                &mut buf,
                STRING_TIMEOUT,
            )
            .map_err(map_rusb_error)?;
        buf.truncate(len);
        Ok(buf)
    }

    fn read_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.handle
            .read_control(request_type, request, value, index, buf, timeout)
            .map_err(map_rusb_error)
    }

    fn write_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.handle
            .write_control(request_type, request, value, index, data, timeout)
            .map_err(map_rusb_error)
    }

    fn read_bulk(&mut self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.handle
            .read_bulk(endpoint, buf, timeout)
            .map_err(map_rusb_error)
    }

    fn write_bulk(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize> {
        self.handle
            .write_bulk(endpoint, data, timeout)
            .map_err(map_rusb_error)
    }

    fn read_interrupt(&mut self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.handle
            .read_interrupt(endpoint, buf, timeout)
            .map_err(map_rusb_error)
    }

    fn write_interrupt(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize> {
        self.handle
            .write_interrupt(endpoint, data, timeout)
            .map_err(map_rusb_error)
    }
}

fn version_to_bcd(version: rusb::Version) -> u16 {
    (u16::from(version.major()) << 8)
        | (u16::from(version.minor()) << 4)
        | (u16::from(version.sub_minor()) & 0x0F)
}

fn transfer_type_bits(kind: rusb::TransferType) -> u8 {
    match kind {
        rusb::TransferType::Control => 0,
        rusb::TransferType::Isochronous => 1,
        rusb::TransferType::Bulk => 2,
        rusb::TransferType::Interrupt => 3,
    }
}

/// Map a raw rusb result code onto the closed error taxonomy
///
/// Unmapped codes become [`UsbError::Internal`] carrying the raw code for
/// diagnostics.
pub fn map_rusb_error(err: rusb::Error) -> UsbError {
    match err {
        rusb::Error::Io => UsbError::Io(err.to_string()),
        rusb::Error::Access => UsbError::PermissionDenied(err.to_string()),
        rusb::Error::NoDevice => UsbError::NoDevice(err.to_string()),
        rusb::Error::Busy => UsbError::NoDevice(format!("device busy: {}", err)),
        rusb::Error::NotFound => UsbError::NotFound(err.to_string()),
        rusb::Error::Timeout => UsbError::TimedOut,
        rusb::Error::Overflow => UsbError::TransferFailed("buffer overflow".to_string()),
        rusb::Error::Pipe => UsbError::TransferFailed("pipe error (stall)".to_string()),
        rusb::Error::Interrupted => UsbError::Cancelled,
        rusb::Error::NotSupported => UsbError::NotSupported(err.to_string()),
        other => UsbError::Internal(format!("libusb error: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), UsbError::TimedOut);
        assert_eq!(map_rusb_error(rusb::Error::Interrupted), UsbError::Cancelled);
        assert!(matches!(
            map_rusb_error(rusb::Error::NoDevice),
            UsbError::NoDevice(_)
        ));
        assert!(matches!(
            map_rusb_error(rusb::Error::Busy),
            UsbError::NoDevice(_)
        ));
        assert!(matches!(
            map_rusb_error(rusb::Error::NoMem),
            UsbError::Internal(_)
        ));
    }

    #[test]
    fn test_version_to_bcd() {
        // 2.0.0 encodes as 0x0200
        let desc = version_to_bcd(rusb::Version(2, 0, 0));
        assert_eq!(desc, 0x0200);
    }

    #[test]
    fn test_transfer_type_bits() {
        assert_eq!(transfer_type_bits(rusb::TransferType::Bulk), 2);
        assert_eq!(transfer_type_bits(rusb::TransferType::Interrupt), 3);
    }
}
