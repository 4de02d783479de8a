//! USB transport layer abstraction.
//!
//! Defines the `UsbTransport` trait for bulk communication with a device
//! in download mode, allowing different implementations (nusb, mock).

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("failed to open device: {0}")]
    OpenFailed(String),

    #[error("failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("no CDC-DATA interface with two bulk endpoints")]
    EndpointNotFound,

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("read failed: {0}")]
    ReadFailed(String),

    #[error("short read: {actual}/{expected} bytes")]
    ShortRead { actual: usize, expected: usize },

    #[error("timed out after {timeout_ms}ms with no data transferred")]
    Timeout { timeout_ms: u64 },

    #[error("device disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract USB transport interface.
///
/// The transport exclusively owns the underlying USB handle; the
/// interface (and any kernel driver detached at claim time) is released
/// when the transport is dropped.
pub trait UsbTransport: Send {
    /// Bulk-OUT transfer. Returns the byte count transferred; a timeout
    /// that moved at least one byte is not an error.
    fn write(&self, data: &[u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Bulk-IN transfer into `buf`. When `exact` is set, a short read
    /// fails with `ShortRead`.
    fn read(
        &self,
        buf: &mut [u8],
        timeout: Duration,
        exact: bool,
    ) -> Result<usize, TransportError>;

    /// Whether the device delimits bulk transfers with zero-length packets.
    fn is_zlp_supported(&self) -> bool;

    /// Whether the device identified itself as a SystemLSI (Exynos) part.
    fn is_system_lsi(&self) -> bool;
}
