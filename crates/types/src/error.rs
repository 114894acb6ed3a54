//! Error taxonomy for the USB access layer
//!
//! Backend result codes are translated into this closed set at the boundary;
//! raw codes never reach callers except embedded in a diagnostic message.

use thiserror::Error;

/// Errors surfaced by context, device, and transfer operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UsbError {
    /// Catch-all for unmapped backend codes; carries the raw code string
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O failure reported by the backend
    #[error("I/O error: {0}")]
    Io(String),

    /// Operation did not complete within its deadline
    #[error("operation timed out")]
    TimedOut,

    /// Requested feature or descriptor is not available
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Insufficient permissions to access the device
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Device is absent, busy, or disappeared mid-operation
    #[error("no device: {0}")]
    NoDevice(String),

    /// Operation requires an open device session
    #[error("device {0} is not open")]
    NotOpen(String),

    /// Device session is already open
    #[error("device {0} is already open")]
    AlreadyOpen(String),

    /// Operation was cancelled before completion
    #[error("operation cancelled")]
    Cancelled,

    /// Transfer was submitted but failed at the bus level
    #[error("transfer failed: {0}")]
    TransferFailed(String),

    /// Lookup miss
    #[error("not found: {0}")]
    NotFound(String),
}

/// Type alias for results within the USB access layer
pub type Result<T> = std::result::Result<T, UsbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_context() {
        let err = UsbError::NotOpen("04f9:2042 [bus 1 addr 7]".to_string());
        let msg = format!("{}", err);
        assert!(msg.contains("04f9:2042"));
        assert!(msg.contains("not open"));
    }

    #[test]
    fn test_lookup_miss_display() {
        let err = UsbError::NotFound("no device with VID:PID 1234:5678".to_string());
        assert!(format!("{}", err).contains("1234:5678"));
    }
}
