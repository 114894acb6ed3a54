//! Transfer paths: blocking and async submission, completion callbacks,
//! cancellation, and emulated replay.

use hostusb::backend::mock::{MockBackend, MockDeviceBuilder};
use hostusb::{CancelHandle, ContextFlags, DeviceContext, TransferOutcome, UsbError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn single_device_context() -> (MockBackend, DeviceContext<MockBackend>) {
    let backend = MockBackend::without_hotplug();
    backend.plug(MockDeviceBuilder::new(0x1234, 0x5678).build());
    let ctx = DeviceContext::new(backend.clone(), ContextFlags::default());
    (backend, ctx)
}

fn drive_until(ctx: &DeviceContext<MockBackend>, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        ctx.process_events();
        if done() {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for a transfer completion"
        );
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn blocking_control_in() {
    let (_backend, ctx) = single_device_context();
    let device = ctx.devices().remove(0);
    device.open().unwrap();

    let outcome = device
        .control_transfer(
            0xC0,
            0x01,
            0,
            0,
            vec![0; 8],
            Duration::from_millis(500),
            None,
        )
        .unwrap();
    assert_eq!(outcome.actual, 8);
    assert_eq!(outcome.data, vec![0, 1, 2, 3, 4, 5, 6, 7]);
}

#[test]
fn blocking_control_out() {
    let (_backend, ctx) = single_device_context();
    let device = ctx.devices().remove(0);
    device.open().unwrap();

    let outcome = device
        .control_transfer(
            0x40,
            0x02,
            0x0001,
            0,
            vec![0xAA; 16],
            Duration::from_millis(500),
            None,
        )
        .unwrap();
    assert_eq!(outcome.actual, 16);
    assert!(outcome.data.is_empty());
}

#[test]
fn blocking_bulk_both_directions() {
    let (_backend, ctx) = single_device_context();
    let device = ctx.devices().remove(0);
    device.open().unwrap();

    let read = device
        .bulk_transfer(0x81, vec![0; 4], Duration::from_millis(500), None)
        .unwrap();
    assert_eq!(read.data, vec![0, 1, 2, 3]);

    let wrote = device
        .bulk_transfer(0x02, vec![9; 32], Duration::from_millis(500), None)
        .unwrap();
    assert_eq!(wrote.actual, 32);
}

#[test]
fn blocking_interrupt_in() {
    let (_backend, ctx) = single_device_context();
    let device = ctx.devices().remove(0);
    device.open().unwrap();

    let outcome = device
        .interrupt_transfer(0x83, vec![0; 2], Duration::from_millis(500), None)
        .unwrap();
    assert_eq!(outcome.actual, 2);
}

#[test]
fn transfer_on_closed_device_fails() {
    let (_backend, ctx) = single_device_context();
    let device = ctx.devices().remove(0);
    let err = device
        .bulk_transfer(0x81, vec![0; 4], Duration::from_millis(100), None)
        .unwrap_err();
    assert!(matches!(err, UsbError::NotOpen(_)));
}

#[test]
fn async_completion_callback_runs_during_event_processing() {
    let (_backend, ctx) = single_device_context();
    let device = ctx.devices().remove(0);
    device.open().unwrap();

    let delivered: Arc<Mutex<Option<hostusb::Result<TransferOutcome>>>> =
        Arc::new(Mutex::new(None));
    let slot = Arc::clone(&delivered);
    let ticket = device
        .control_transfer_async(
            0xC0,
            0x01,
            0,
            0,
            vec![0; 4],
            Duration::from_millis(500),
            None,
            Some(Box::new(move |ticket| {
                *slot.lock().unwrap() = Some(ticket.finish());
            })),
        )
        .unwrap();

    drive_until(&ctx, || delivered.lock().unwrap().is_some());
    assert!(ticket.is_complete());
    let outcome = delivered.lock().unwrap().take().unwrap().unwrap();
    assert_eq!(outcome.actual, 4);
}

#[test]
fn pre_cancelled_submission_is_rejected() {
    let (_backend, ctx) = single_device_context();
    let device = ctx.devices().remove(0);
    device.open().unwrap();

    let cancel = CancelHandle::new();
    cancel.cancel();
    let err = device
        .bulk_transfer(0x81, vec![0; 4], Duration::from_millis(500), Some(&cancel))
        .unwrap_err();
    assert_eq!(err, UsbError::Cancelled);
}

#[test]
fn finish_can_be_deferred_past_the_callback() {
    let (_backend, ctx) = single_device_context();
    let device = ctx.devices().remove(0);
    device.open().unwrap();

    // no callback: poll the ticket and collect the result later
    let ticket = device
        .bulk_transfer_async(0x81, vec![0; 6], Duration::from_millis(500), None, None)
        .unwrap();
    drive_until(&ctx, || ticket.is_complete());
    let outcome = ticket.finish().unwrap();
    assert_eq!(outcome.actual, 6);
    assert!(matches!(ticket.finish(), Err(UsbError::Internal(_))));
}

#[test]
fn emulated_device_replays_recorded_control_transfers() {
    let backend = MockBackend::without_hotplug();
    let ctx = DeviceContext::new(backend, ContextFlags::default());
    ctx.load_snapshot_json(
        r#"{
            "UsbDevices": [{
                "PlatformId": "usb:01:04",
                "IdVendor": 1273,
                "IdProduct": 8258,
                "UsbEvents": [{
                    "Id": "c0:33:0000:0000:0008",
                    "Status": 0,
                    "Rc": 8,
                    "Data": "AQIDBAUGBwg="
                }]
            }]
        }"#,
    )
    .unwrap();

    let device = ctx.find_by_vid_pid(1273, 8258).unwrap();
    assert!(device.is_emulated());
    device.open().unwrap();

    let outcome = device
        .control_transfer(
            0xC0,
            0x33,
            0,
            0,
            vec![0; 8],
            Duration::from_millis(500),
            None,
        )
        .unwrap();
    assert_eq!(outcome.data, vec![1, 2, 3, 4, 5, 6, 7, 8]);

    // nothing recorded for this setup
    let err = device
        .control_transfer(
            0xC0,
            0x44,
            0,
            0,
            vec![0; 8],
            Duration::from_millis(500),
            None,
        )
        .unwrap_err();
    assert!(matches!(err, UsbError::NotSupported(_)));

    // bulk cannot be replayed at all
    let err = device
        .bulk_transfer(0x81, vec![0; 8], Duration::from_millis(500), None)
        .unwrap_err();
    assert!(matches!(err, UsbError::NotSupported(_)));
}
