//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::MockTransport;
pub use nusb::{DownloadDevice, NusbTransport, list_download_devices};
pub use traits::{TransportError, UsbTransport};
