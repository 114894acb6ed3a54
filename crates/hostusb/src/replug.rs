//! Replug tracking
//!
//! A replug wait pins the platform id of a device expected to drop off the
//! bus and come back (firmware flash, bus reset). While the wait is pending,
//! removal of that identity is suppressed from subscribers; an arrival with
//! the same identity resolves the wait with the replacement device.

use crate::backend::UsbBackend;
use crate::device::UsbDevice;
use std::sync::Arc;

pub(crate) struct ReplugWaiter<B: UsbBackend> {
    original: Arc<UsbDevice<B>>,
    removed: Option<Arc<UsbDevice<B>>>,
    replacement: Option<Arc<UsbDevice<B>>>,
}

/// What happened while the wait was pending
pub(crate) struct ReplugOutcome<B: UsbBackend> {
    /// The device instance whose removal notification was withheld
    pub(crate) removed: Option<Arc<UsbDevice<B>>>,
    /// The new device instance, if the identity reappeared
    pub(crate) replacement: Option<Arc<UsbDevice<B>>>,
}

impl<B: UsbBackend> ReplugWaiter<B> {
    pub(crate) fn new(original: Arc<UsbDevice<B>>) -> Self {
        ReplugWaiter {
            original,
            removed: None,
            replacement: None,
        }
    }

    pub(crate) fn original(&self) -> &Arc<UsbDevice<B>> {
        &self.original
    }

    /// Record the suppressed removal; only the first removal is kept
    pub(crate) fn note_removed(&mut self, device: Arc<UsbDevice<B>>) {
        if self.removed.is_none() {
            self.removed = Some(device);
        }
    }

    /// Record the matching arrival; only the first arrival resolves the wait
    pub(crate) fn resolve(&mut self, device: Arc<UsbDevice<B>>) {
        if self.replacement.is_none() {
            self.replacement = Some(device);
        }
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.replacement.is_some()
    }

    pub(crate) fn into_outcome(self) -> ReplugOutcome<B> {
        ReplugOutcome {
            removed: self.removed,
            replacement: self.replacement,
        }
    }
}
