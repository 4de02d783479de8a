//! Mock USB transport for testing.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use super::traits::{TransportError, UsbTransport};

/// Mock transport for unit testing protocol engine logic.
///
/// Reads pop scripted responses in FIFO order; writes are captured for
/// later inspection.
pub struct MockTransport {
    /// Queued responses returned on read.
    responses: Mutex<VecDeque<Vec<u8>>>,
    /// Captured writes.
    write_log: Mutex<Vec<Vec<u8>>>,
    /// Whether the device is "connected".
    connected: Mutex<bool>,
    zlp_supported: bool,
    system_lsi: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            write_log: Mutex::new(Vec::new()),
            connected: Mutex::new(true),
            zlp_supported: false,
            system_lsi: false,
        }
    }

    /// Queue a raw response to be returned on the next read.
    pub fn queue_response(&self, bytes: &[u8]) {
        self.responses.lock().unwrap().push_back(bytes.to_vec());
    }

    /// Queue an 8-byte command echo (cmd at offset 0, scalar at 4).
    pub fn queue_echo(&self, cmd: u32, value: i32) {
        let mut buf = Vec::with_capacity(8);
        buf.extend_from_slice(&cmd.to_le_bytes());
        buf.extend_from_slice(&value.to_le_bytes());
        self.queue_response(&buf);
    }

    /// Queue a 12-byte response carrying a second scalar at offset 8.
    pub fn queue_echo_extra(&self, cmd: u32, value: i32, extra: i32) {
        let mut buf = Vec::with_capacity(12);
        buf.extend_from_slice(&cmd.to_le_bytes());
        buf.extend_from_slice(&value.to_le_bytes());
        buf.extend_from_slice(&extra.to_le_bytes());
        self.queue_response(&buf);
    }

    /// Get all captured writes.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().unwrap().clone()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.write_log.lock().unwrap().clear();
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }

    pub fn with_zlp(mut self, zlp: bool) -> Self {
        self.zlp_supported = zlp;
        self
    }

    pub fn with_system_lsi(mut self, lsi: bool) -> Self {
        self.system_lsi = lsi;
        self
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport for MockTransport {
    fn write(&self, data: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        self.write_log.lock().unwrap().push(data.to_vec());
        Ok(data.len())
    }

    fn read(
        &self,
        buf: &mut [u8],
        timeout: Duration,
        exact: bool,
    ) -> Result<usize, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        let resp = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            })?;

        if exact && resp.len() < buf.len() {
            return Err(TransportError::ShortRead {
                actual: resp.len(),
                expected: buf.len(),
            });
        }

        let n = resp.len().min(buf.len());
        buf[..n].copy_from_slice(&resp[..n]);
        Ok(n)
    }

    fn is_zlp_supported(&self) -> bool {
        self.zlp_supported
    }

    fn is_system_lsi(&self) -> bool {
        self.system_lsi
    }
}
