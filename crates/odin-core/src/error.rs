//! Crate-level error taxonomy.
//!
//! Module layers carry their own error enums; everything surfaced to a
//! caller of the engine or session is folded into `OdinError`. The
//! engine never recovers from any of these: an error aborts the session
//! after a best-effort close.

use thiserror::Error;

use crate::package::PackageError;
use crate::pit::PitError;
use crate::protocol::{ProtocolError, WriteProtectKind};
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum OdinError {
    /// USB failure, timeout, or short transfer.
    #[error("transport: {0}")]
    Transport(TransportError),

    /// Unexpected echo or truncated response.
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),

    /// Negative failure code reported by the device.
    #[error("{0}")]
    WriteProtect(WriteProtectKind),

    /// PIT magic mismatch or truncated table.
    #[error("PIT: {0}")]
    PitFormat(#[from] PitError),

    /// Unrecognised container or archive.
    #[error("package: {0}")]
    PackageFormat(PackageError),

    /// MD5 / SHA-256 mismatch.
    #[error("integrity: {0}")]
    Integrity(PackageError),

    /// Device not found, descriptor unreadable, or claim refused.
    #[error("device: {0}")]
    Device(TransportError),
}

impl From<TransportError> for OdinError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::DeviceNotFound(_)
            | TransportError::OpenFailed(_)
            | TransportError::ClaimInterfaceFailed { .. }
            | TransportError::EndpointNotFound => OdinError::Device(e),
            other => OdinError::Transport(other),
        }
    }
}

impl From<PackageError> for OdinError {
    fn from(e: PackageError) -> Self {
        match e {
            PackageError::IntegrityMismatch { .. } => OdinError::Integrity(e),
            other => OdinError::PackageFormat(other),
        }
    }
}
