//! Odin-Core: Samsung download-mode flashing protocol in Rust.
//!
//! This crate implements the wire protocol spoken to Samsung mobile
//! devices in their proprietary USB download mode, plus the firmware
//! package ingest pipeline that feeds it.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Command codes, packet framing, response parsing
//! - **Transport**: USB communication abstraction (nusb, mock)
//! - **Package**: Firmware ingest (tar, LZ4 sniffing, gzip, integrity)
//! - **PIT**: Partition Information Table codec
//! - **Engine**: The session state machine
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level per-device orchestrator
//!
//! # Example
//!
//! ```no_run
//! use odin_core::session::{FlashSession, SessionConfig};
//!
//! let config = SessionConfig {
//!     ap: Some("AP_XXXX.tar.md5".to_string()),
//!     reboot: true,
//!     ..Default::default()
//! };
//!
//! let package = config.build_package().expect("package ingest failed");
//! let session = FlashSession::new("/dev/bus/usb/003/007".to_string(), package, config);
//! session.run().expect("flash failed");
//! ```

pub mod engine;
pub mod error;
pub mod events;
pub mod package;
pub mod pit;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use engine::{ProtocolEngine, SessionState};
pub use error::OdinError;
pub use events::{FlashEvent, FlashObserver, FlashPhase, LogLevel, NullObserver, TracingObserver};
pub use package::{Compression, FirmwareEntry, FirmwarePackage, Lz4FrameInfo, PayloadKind};
pub use pit::{PitEntry, PitTable};
pub use protocol::{CmdResponse, WriteProtectKind};
pub use session::{FlashSession, SessionConfig};
pub use transport::{
    DownloadDevice, MockTransport, NusbTransport, TransportError, UsbTransport,
    list_download_devices,
};
