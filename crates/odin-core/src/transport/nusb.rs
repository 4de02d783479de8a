//! nusb-based USB transport implementation.

use std::io::{Read, Write};
use std::time::Duration;

use nusb::transfer::{Bulk, Direction, In, Out};
use nusb::{DeviceInfo, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, warn};

use super::traits::{TransportError, UsbTransport};
use crate::protocol::constants::{SAMSUNG_VENDOR_ID, SUPPORTED_PIDS, USB_CLASS_CDC_DATA};

/// Internal buffer size for the blocking endpoint reader/writer.
const ENDPOINT_BUF_SIZE: usize = 16384;

/// A Samsung device found in download mode.
#[derive(Debug, Clone)]
pub struct DownloadDevice {
    /// Canonical `/dev/bus/usb/<bus>/<addr>` path.
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
}

/// Scan the bus for devices in download mode, in host enumeration order.
pub fn list_download_devices() -> Result<Vec<DownloadDevice>, TransportError> {
    let devices = list_devices()
        .wait()
        .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

    Ok(devices
        .filter(is_download_device)
        .map(|d| DownloadDevice {
            path: canonical_path(&d),
            vendor_id: d.vendor_id(),
            product_id: d.product_id(),
            manufacturer: d.manufacturer_string().map(str::to_owned),
            product: d.product_string().map(str::to_owned),
            serial: d.serial_number().map(str::to_owned),
        })
        .collect())
}

fn is_download_device(d: &DeviceInfo) -> bool {
    d.vendor_id() == SAMSUNG_VENDOR_ID && SUPPORTED_PIDS.contains(&d.product_id())
}

fn canonical_path(d: &DeviceInfo) -> String {
    format!(
        "/dev/bus/usb/{:0>3}/{:03}",
        d.bus_id(),
        d.device_address()
    )
}

/// Match a user-supplied `/dev/bus/usb/<bus>/<addr>` path against a
/// device. Bus and address compare numerically, so `/dev/bus/usb/3/7`
/// and `/dev/bus/usb/003/007` both match.
fn path_matches(requested: &str, d: &DeviceInfo) -> bool {
    let Some(rest) = requested.strip_prefix("/dev/bus/usb/") else {
        return false;
    };
    let mut parts = rest.split('/');
    let (Some(bus), Some(addr), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    let (Ok(bus), Ok(addr)) = (bus.parse::<u32>(), addr.parse::<u32>()) else {
        return false;
    };
    d.bus_id().parse::<u32>().is_ok_and(|b| b == bus) && u32::from(d.device_address()) == addr
}

/// nusb-based transport for one download-mode device.
///
/// Owns the claimed interface; dropping the transport releases the
/// interface and re-attaches any kernel driver detached at claim time.
pub struct NusbTransport {
    interface: Interface,
    in_endpoint: u8,
    out_endpoint: u8,
    vid: u16,
    pid: u16,
    system_lsi: bool,
    zlp_supported: bool,
}

impl NusbTransport {
    /// Open the device at `device_path`. An empty or unmatched path
    /// falls back to the first Samsung device in download mode.
    #[instrument(level = "info")]
    pub fn open(device_path: &str) -> Result<Self, TransportError> {
        let devices: Vec<DeviceInfo> = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .collect();

        let device_info = devices
            .iter()
            .find(|d| path_matches(device_path, d))
            .or_else(|| {
                if !device_path.is_empty() {
                    debug!(path = %device_path, "no device at path, falling back to discovery");
                }
                devices.iter().find(|d| is_download_device(d))
            })
            .ok_or_else(|| {
                TransportError::DeviceNotFound(format!(
                    "VID={SAMSUNG_VENDOR_ID:04X} PID={PIDS:04X?}",
                    PIDS = SUPPORTED_PIDS
                ))
            })?;

        Self::open_device_info(device_info)
    }

    fn open_device_info(device_info: &DeviceInfo) -> Result<Self, TransportError> {
        let vid = device_info.vendor_id();
        let pid = device_info.product_id();

        info!(
            path = %canonical_path(device_info),
            vendor_id = %format!("{vid:04X}"),
            product_id = %format!("{pid:04X}"),
            "Found device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        // Select the first CDC-DATA interface carrying exactly two bulk
        // endpoints and record their addresses by direction bit.
        let mut selected: Option<(u8, u8, u8, u8)> = None;
        'outer: for config in device.configurations() {
            for iface in config.interfaces() {
                for alt in iface.alt_settings() {
                    if alt.class() != USB_CLASS_CDC_DATA {
                        continue;
                    }
                    let mut in_endpoint = None;
                    let mut out_endpoint = None;
                    let mut endpoint_count = 0usize;
                    for ep in alt.endpoints() {
                        endpoint_count += 1;
                        if ep.transfer_type() != nusb::descriptors::TransferType::Bulk {
                            continue;
                        }
                        match ep.direction() {
                            Direction::In => in_endpoint = Some(ep.address()),
                            Direction::Out => out_endpoint = Some(ep.address()),
                        }
                    }
                    if endpoint_count != 2 {
                        continue;
                    }
                    if let (Some(ep_in), Some(ep_out)) = (in_endpoint, out_endpoint) {
                        selected = Some((
                            iface.interface_number(),
                            alt.alternate_setting(),
                            ep_in,
                            ep_out,
                        ));
                        break 'outer;
                    }
                }
            }
        }

        let (iface_num, alt_num, in_endpoint, out_endpoint) =
            selected.ok_or(TransportError::EndpointNotFound)?;

        let interface = device
            .detach_and_claim_interface(iface_num)
            .wait()
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface: iface_num,
                message: e.to_string(),
            })?;

        if alt_num != 0 {
            interface
                .set_alt_setting(alt_num)
                .wait()
                .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        }

        // Product-string inspection elects the SystemLSI (Exynos) flag;
        // ZLP support is assumed for discovered devices.
        let product = device_info.product_string().unwrap_or_default();
        let system_lsi = product.contains("SAMSUNG") || product.contains("LSI");
        if !product.is_empty() {
            info!(product = %product, system_lsi, "Product string");
        }

        info!(
            interface = iface_num,
            in_ep = %format!("0x{in_endpoint:02X}"),
            out_ep = %format!("0x{out_endpoint:02X}"),
            "Device opened successfully"
        );

        Ok(Self {
            interface,
            in_endpoint,
            out_endpoint,
            vid,
            pid,
            system_lsi,
            zlp_supported: true,
        })
    }

    pub fn vendor_id(&self) -> u16 {
        self.vid
    }

    pub fn product_id(&self) -> u16 {
        self.pid
    }
}

impl UsbTransport for NusbTransport {
    #[instrument(skip(self, data), fields(len = data.len()))]
    fn write(&self, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        let ep = self
            .interface
            .endpoint::<Bulk, Out>(self.out_endpoint)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        let mut writer = ep.writer(ENDPOINT_BUF_SIZE).with_write_timeout(timeout);

        // A timeout is not an error if any bytes moved, so the count has
        // to be accumulated write by write rather than via write_all.
        let mut written = 0usize;
        while written < data.len() {
            match writer.write(&data[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if written > 0 && is_timeout(&e) => {
                    warn!(bytes_written = written, "Write timed out after partial transfer");
                    return Ok(written);
                }
                Err(e) => return Err(map_io_error(e, timeout)),
            }
        }
        match writer.flush() {
            Ok(()) => {}
            Err(e) if written > 0 && is_timeout(&e) => {
                warn!(bytes_written = written, "Flush timed out after partial transfer");
                return Ok(written);
            }
            Err(e) => return Err(map_io_error(e, timeout)),
        }

        debug!(bytes_written = written, "Write complete");
        Ok(written)
    }

    #[instrument(skip(self, buf), fields(len = buf.len(), exact))]
    fn read(
        &self,
        buf: &mut [u8],
        timeout: Duration,
        exact: bool,
    ) -> Result<usize, TransportError> {
        let ep = self
            .interface
            .endpoint::<Bulk, In>(self.in_endpoint)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        let mut reader = ep.reader(ENDPOINT_BUF_SIZE).with_read_timeout(timeout);

        let n = if exact {
            // Fill manually so a short read reports how many bytes
            // actually arrived; read_exact discards that count.
            let mut filled = 0usize;
            while filled < buf.len() {
                match reader.read(&mut buf[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) if filled > 0 && is_timeout(&e) => break,
                    Err(e) => return Err(map_io_error(e, timeout)),
                }
            }
            if filled < buf.len() {
                warn!(
                    bytes_read = filled,
                    expected = buf.len(),
                    "short read on exact transfer"
                );
                return Err(TransportError::ShortRead {
                    actual: filled,
                    expected: buf.len(),
                });
            }
            filled
        } else {
            reader.read(buf).map_err(|e| map_io_error(e, timeout))?
        };

        debug!(bytes_read = n, "Read complete");
        Ok(n)
    }

    fn is_zlp_supported(&self) -> bool {
        self.zlp_supported
    }

    fn is_system_lsi(&self) -> bool {
        self.system_lsi
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
    )
}

fn map_io_error(e: std::io::Error, timeout: Duration) -> TransportError {
    match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        },
        std::io::ErrorKind::NotConnected | std::io::ErrorKind::BrokenPipe => {
            TransportError::Disconnected
        }
        _ => TransportError::Io(e),
    }
}
