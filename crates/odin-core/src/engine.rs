//! Protocol engine - the download session state machine.
//!
//! Drives one strictly sequential command/response session against a
//! device in download mode: handshake, session setup, device info, PIT
//! exchange, per-entry file transfer, close. A command's response is
//! always read before the next command is written; there is no retry at
//! this layer, and any failure aborts the session after a best-effort
//! close.

use std::fmt;
use std::fs::File;
use std::io::Read;

use tracing::{debug, info, instrument, warn};

use crate::error::OdinError;
use crate::events::{FlashEvent, FlashObserver, FlashPhase};
use crate::package::{FirmwareEntry, FirmwarePackage, PackageError};
use crate::pit::PitTable;
use crate::protocol::constants::{
    CMD_PACKET_SIZE, COMMAND_TIMEOUT, Cmd, DEFAULT_PACKET_SIZE, DEVINFO_MAGIC, HANDSHAKE_GREETING,
    HANDSHAKE_REPLY, HANDSHAKE_TIMEOUT, MAX_PACKET_SIZE, PIT_TRANSFER_GRANULE, TRANSFER_TIMEOUT,
    conn, devinfo, file as file_cmd, pit as pit_cmd, session as session_cmd,
};
use crate::protocol::packet::{CmdPacket, CmdResponse, ProtocolError, WriteProtectKind};
use crate::transport::UsbTransport;

/// Session lifecycle states. The only accepting terminal is `Closed`;
/// every error transition leads to `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Handshaken,
    SessionOpen,
    PitReceived,
    Ready,
    Closed,
    Aborted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "DISCONNECTED"),
            SessionState::Handshaken => write!(f, "HANDSHAKEN"),
            SessionState::SessionOpen => write!(f, "SESSION_OPEN"),
            SessionState::PitReceived => write!(f, "PIT_RECEIVED"),
            SessionState::Ready => write!(f, "READY"),
            SessionState::Closed => write!(f, "CLOSED"),
            SessionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// One flashing attempt on one physical device.
///
/// Borrows the transport and the package read-only for the session
/// lifetime; all volatile session state (packet size, flags) lives here
/// and dies with the engine.
pub struct ProtocolEngine<'a, T: UsbTransport, O: FlashObserver> {
    transport: &'a T,
    package: &'a FirmwarePackage,
    observer: &'a O,
    state: SessionState,
    phase: FlashPhase,
    packet_size: usize,
    device_info_received: bool,
}

impl<'a, T: UsbTransport, O: FlashObserver> ProtocolEngine<'a, T, O> {
    pub fn new(transport: &'a T, package: &'a FirmwarePackage, observer: &'a O) -> Self {
        Self {
            transport,
            package,
            observer,
            state: SessionState::Disconnected,
            phase: FlashPhase::Handshake,
            packet_size: DEFAULT_PACKET_SIZE,
            device_info_received: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    pub fn device_info_received(&self) -> bool {
        self.device_info_received
    }

    /// Run the full download sequence. Any error aborts the session
    /// after a best-effort close.
    #[instrument(skip(self))]
    pub fn download(&mut self, reboot: bool) -> Result<(), OdinError> {
        match self.run_download(reboot) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.emit(FlashEvent::Error {
                    message: e.to_string(),
                });
                self.abort();
                Err(e)
            }
        }
    }

    fn run_download(&mut self, reboot: bool) -> Result<(), OdinError> {
        self.handshake()?;
        self.begin_session()?;

        if let Err(e) = self.get_device_info() {
            warn!(error = %e, "Device info unavailable, continuing");
        }

        let pit = self.receive_pit()?;
        self.log_pit_coverage(&pit);
        self.send_pit()?;

        let package = self.package;
        for entry in package.entries() {
            self.transfer_entry(entry)?;
        }

        self.close_session()?;
        if reboot {
            self.reboot()?;
        }

        self.enter_phase(FlashPhase::Complete);
        self.emit(FlashEvent::Complete);
        Ok(())
    }

    /// Handshake and session begin, then reboot the device back into
    /// download mode instead of flashing.
    #[instrument(skip(self))]
    pub fn redownload(&mut self) -> Result<(), OdinError> {
        match self.run_redownload() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.emit(FlashEvent::Error {
                    message: e.to_string(),
                });
                self.abort();
                Err(e)
            }
        }
    }

    fn run_redownload(&mut self) -> Result<(), OdinError> {
        self.handshake()?;
        self.begin_session()?;
        info!("Rebooting to download mode");
        self.command(Cmd::Connection, conn::REDOWNLOAD, 0)?;
        self.goto_state(SessionState::Closed);
        Ok(())
    }

    /// ODIN/LOKE greeting exchange.
    pub fn handshake(&mut self) -> Result<(), OdinError> {
        self.enter_phase(FlashPhase::Handshake);
        info!("Setting up connection (ODIN/LOKE handshake)");

        let written = self.transport.write(HANDSHAKE_GREETING, HANDSHAKE_TIMEOUT)?;
        if written != HANDSHAKE_GREETING.len() {
            return Err(ProtocolError::ShortWrite {
                written,
                expected: HANDSHAKE_GREETING.len(),
            }
            .into());
        }

        let mut buf = [0u8; 64];
        let n = self.transport.read(&mut buf, HANDSHAKE_TIMEOUT, false)?;
        if n >= 4 && &buf[..4] == HANDSHAKE_REPLY {
            info!("Handshake successful (LOKE received)");
            self.goto_state(SessionState::Handshaken);
            return Ok(());
        }

        Err(ProtocolError::HandshakeRejected {
            reply: String::from_utf8_lossy(&buf[..n.min(4)]).into_owned(),
        }
        .into())
    }

    /// Session begin, packet-size negotiation and erase mode.
    pub fn begin_session(&mut self) -> Result<(), OdinError> {
        self.enter_phase(FlashPhase::SessionSetup);

        let r = self.command(Cmd::SessionControl, session_cmd::BEGIN, 0)?;
        info!(result = r, "Session begun");

        // A non-zero result means the device accepts large packets.
        if r != 0 {
            self.command(
                Cmd::SessionControl,
                session_cmd::SET_PACKET_SIZE,
                MAX_PACKET_SIZE as u32,
            )?;
            self.packet_size = MAX_PACKET_SIZE;
            info!(packet_size = self.packet_size, "Packet size raised");
        }

        if self.transport.is_zlp_supported() {
            match self.command(Cmd::SessionControl, session_cmd::GET_TOTAL_BYTES, 0) {
                Ok(total) => info!(total_bytes = total, "Device total bytes"),
                Err(e) => debug!(error = %e, "Total-bytes query failed (advisory)"),
            }
        }

        if self.package.is_erase() {
            self.command(Cmd::SessionControl, session_cmd::ENABLE_TFLASH, 1)?;
            info!("Erase mode enabled");
        }

        self.goto_state(SessionState::SessionOpen);
        Ok(())
    }

    /// Read the device info block. The content beyond the magic and
    /// entry count is opaque; callers treat failures as non-fatal.
    pub fn get_device_info(&mut self) -> Result<(), OdinError> {
        self.enter_phase(FlashPhase::DeviceInfo);

        let size = self.command(Cmd::DeviceInfo, devinfo::GET_SIZE, 0)?;
        if size <= 0 {
            return Err(ProtocolError::InvalidSize {
                context: "device info size",
                value: size.into(),
            }
            .into());
        }

        self.send_request(Cmd::DeviceInfo, devinfo::GET_DATA, size as u32)?;
        let mut data = vec![0u8; size as usize];
        let n = self.transport.read(&mut data, TRANSFER_TIMEOUT, false)?;
        if n < 8 {
            return Err(ProtocolError::Truncated {
                actual: n,
                expected: 8,
            }
            .into());
        }

        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if magic != DEVINFO_MAGIC {
            return Err(ProtocolError::BadMagic {
                context: "device info",
                magic,
            }
            .into());
        }
        let entry_count = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        info!(entries = entry_count, "Device info block");

        self.command(Cmd::DeviceInfo, devinfo::END, 0)?;
        self.device_info_received = true;
        Ok(())
    }

    /// Receive and parse the device's PIT.
    pub fn receive_pit(&mut self) -> Result<PitTable, OdinError> {
        self.enter_phase(FlashPhase::PitExchange);
        info!("Receiving PIT from device");

        if self.packet_size == MAX_PACKET_SIZE {
            // Advisory only; the (0x65,1) response below is authoritative.
            let advisory = self.command(Cmd::SessionControl, session_cmd::PIT_SIZE_QUERY, 0)?;
            if advisory <= 0 {
                return Err(ProtocolError::InvalidSize {
                    context: "PIT size query",
                    value: advisory.into(),
                }
                .into());
            }
            debug!(advisory, "PIT size query");
        }

        let n = self.command(Cmd::Pit, pit_cmd::SIZE, 0)?;
        if n <= 0 {
            return Err(ProtocolError::InvalidSize {
                context: "PIT size",
                value: n.into(),
            }
            .into());
        }
        let n = n as usize;

        // The device pads the table to a 500-byte granule on the wire.
        let t = n.div_ceil(PIT_TRANSFER_GRANULE) * PIT_TRANSFER_GRANULE;
        self.send_request(Cmd::Pit, pit_cmd::DATA, t as u32)?;

        let mut data = vec![0u8; t];
        self.transport.read(&mut data, TRANSFER_TIMEOUT, true)?;
        info!(bytes = t, pit_size = n, "Received PIT data");

        self.command(Cmd::Pit, pit_cmd::END, 0)?;

        let table = PitTable::parse(&data[..n])?;
        table.log_summary();
        self.goto_state(SessionState::PitReceived);
        Ok(table)
    }

    fn log_pit_coverage(&self, table: &PitTable) {
        for entry in self.package.entries() {
            let matched = table
                .find_entry(&entry.partition_name)
                .or_else(|| table.find_entry_by_filename(&entry.filename));
            match matched {
                Some(pe) => debug!(
                    partition = %entry.partition_name,
                    id = pe.partition_id,
                    "Partition present in device PIT"
                ),
                None => warn!(
                    partition = %entry.partition_name,
                    file = %entry.filename,
                    "Partition not present in device PIT"
                ),
            }
        }
    }

    /// Stream the user-supplied PIT to the device, if one was given.
    pub fn send_pit(&mut self) -> Result<(), OdinError> {
        let package = self.package;
        let Some(path) = package.pit_path() else {
            self.goto_state(SessionState::Ready);
            return Ok(());
        };

        info!(path = %path.display(), "Sending PIT");
        self.command(Cmd::Pit, pit_cmd::START, 0)?;

        let size = package.pit_size() as usize;
        self.command(Cmd::Pit, pit_cmd::SIZE, size as u32)?;

        let mut file = File::open(path).map_err(PackageError::from)?;
        let mut chunk = vec![0u8; self.packet_size];
        let mut remaining = size;
        while remaining > 0 {
            let len = remaining.min(self.packet_size);
            file.read_exact(&mut chunk[..len]).map_err(PackageError::from)?;

            let written = self.transport.write(&chunk[..len], TRANSFER_TIMEOUT)?;
            if written != len {
                return Err(ProtocolError::ShortWrite {
                    written,
                    expected: len,
                }
                .into());
            }
            self.read_data_ack(Cmd::Pit)?;
            remaining -= len;
        }

        self.command(Cmd::Pit, pit_cmd::END, 0)?;
        self.goto_state(SessionState::Ready);
        Ok(())
    }

    /// Transfer one entry's buffer in packet-size chunks, each ACKed.
    /// Compressed entries go byte-for-byte; the LZ4 framing bits tell
    /// the device how to decode.
    #[instrument(skip(self, entry), fields(partition = %entry.partition_name, bytes = entry.size))]
    pub fn transfer_entry(&mut self, entry: &FirmwareEntry) -> Result<(), OdinError> {
        self.enter_phase(FlashPhase::FileTransfer);
        info!(
            file = %entry.filename,
            partition = %entry.partition_name,
            bytes = entry.size,
            compression = ?entry.compression,
            "Transmitting"
        );

        self.command(Cmd::FileTransfer, file_cmd::START, 0)?;
        self.command(Cmd::FileTransfer, file_cmd::SET_INFO, entry.size as u32)?;

        let data = &entry.data;
        let total = data.len();
        let mut sent = 0usize;
        let mut last_decile = 0;

        while sent < total {
            let len = (total - sent).min(self.packet_size);
            let written = self.transport.write(&data[sent..sent + len], TRANSFER_TIMEOUT)?;
            if written != len {
                return Err(ProtocolError::ShortWrite {
                    written,
                    expected: len,
                }
                .into());
            }
            self.read_data_ack(Cmd::FileTransfer)?;
            sent += len;

            let decile = sent * 10 / total;
            if decile > last_decile {
                last_decile = decile;
                info!(partition = %entry.partition_name, progress = %format!("{}%", decile * 10), "Progress");
                self.emit(FlashEvent::Progress {
                    partition: entry.partition_name.clone(),
                    sent: sent as u64,
                    total: total as u64,
                });
            }
        }

        self.command(Cmd::FileTransfer, file_cmd::END, 0)?;
        info!(file = %entry.filename, "Transfer complete");
        Ok(())
    }

    /// End the session with an acknowledged close.
    pub fn close_session(&mut self) -> Result<(), OdinError> {
        self.enter_phase(FlashPhase::Closing);
        info!("Closing session");
        self.command(Cmd::Connection, conn::CLOSE, 0)?;
        self.goto_state(SessionState::Closed);
        Ok(())
    }

    /// Trigger a normal reboot. No response is awaited.
    pub fn reboot(&mut self) -> Result<(), OdinError> {
        info!("Rebooting to normal mode");
        self.send_request(Cmd::Connection, conn::REBOOT, 0)
    }

    /// Best-effort close, then mark the session aborted. Partial
    /// transfers leave the device wherever the abort reached; nothing
    /// is retried.
    fn abort(&mut self) {
        if !matches!(
            self.state,
            SessionState::Disconnected | SessionState::Closed
        ) {
            let closed = self
                .send_request(Cmd::Connection, conn::CLOSE, 0)
                .and_then(|()| self.read_response(Cmd::Connection).map(|_| ()));
            if let Err(e) = closed {
                debug!(error = %e, "Best-effort close failed");
            }
        }
        self.enter_phase(FlashPhase::Error);
        self.goto_state(SessionState::Aborted);
    }

    fn send_request(&self, cmd: Cmd, sub: u32, arg: u32) -> Result<(), OdinError> {
        debug!(?cmd, sub, arg, "Request");
        let packet = CmdPacket::new(cmd, sub, arg).to_bytes();
        let written = self.transport.write(&packet, COMMAND_TIMEOUT)?;
        if written != packet.len() {
            return Err(ProtocolError::ShortWrite {
                written,
                expected: packet.len(),
            }
            .into());
        }
        Ok(())
    }

    fn read_response(&self, sent: Cmd) -> Result<CmdResponse, OdinError> {
        let mut buf = vec![0u8; CMD_PACKET_SIZE];
        let n = self.transport.read(&mut buf, COMMAND_TIMEOUT, false)?;
        Ok(CmdResponse::parse(&buf[..n], sent)?)
    }

    /// One command/response exchange; returns the echoed scalar.
    fn command(&self, cmd: Cmd, sub: u32, arg: u32) -> Result<i32, OdinError> {
        self.send_request(cmd, sub, arg)?;
        match self.read_response(cmd)? {
            CmdResponse::Echo { value, .. } => Ok(value),
            CmdResponse::Fail { code } => {
                let kind = WriteProtectKind::from(code);
                warn!(%kind, "Device reported failure");
                Err(OdinError::WriteProtect(kind))
            }
        }
    }

    /// ACK read after a bulk data chunk: at least 8 bytes, echoed command.
    fn read_data_ack(&self, cmd: Cmd) -> Result<(), OdinError> {
        let mut buf = [0u8; 64];
        let n = self.transport.read(&mut buf, TRANSFER_TIMEOUT, false)?;
        match CmdResponse::parse(&buf[..n], cmd)? {
            CmdResponse::Echo { .. } => Ok(()),
            CmdResponse::Fail { code } => Err(OdinError::WriteProtect(code.into())),
        }
    }

    fn goto_state(&mut self, new: SessionState) {
        debug!(from = %self.state, to = %new, "State transition");
        self.state = new;
    }

    fn enter_phase(&mut self, to: FlashPhase) {
        if self.phase != to {
            self.emit(FlashEvent::PhaseChanged {
                from: self.phase,
                to,
            });
            self.phase = to;
        }
    }

    fn emit(&self, event: FlashEvent) {
        self.observer.on_event(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::package::{Compression, FirmwareEntry, PayloadKind};
    use crate::pit::{PitEntry, PitTable};
    use crate::transport::MockTransport;
    use std::io::Write;

    const OBS: NullObserver = NullObserver;

    fn triple(packet: &[u8]) -> (u32, u32, u32) {
        let le = |o: usize| u32::from_le_bytes(packet[o..o + 4].try_into().unwrap());
        (le(0), le(4), le(8))
    }

    fn sample_pit() -> PitTable {
        let entry = |id: u32, name: &str, filename: &str| PitEntry {
            partition_id: id,
            block_count: id * 2048,
            partition_name: name.to_string(),
            flash_filename: filename.to_string(),
            ..PitEntry::default()
        };
        PitTable {
            gang_name: "COM_TAR2".to_string(),
            project_name: "GT-TEST".to_string(),
            entries: vec![
                entry(1, "BOOT", "boot.img"),
                entry(2, "MODEM", "modem.bin"),
                entry(3, "CACHE", "cache.img"),
            ],
        }
    }

    /// Queue a complete device-info exchange.
    fn queue_device_info(mock: &MockTransport) {
        mock.queue_echo(0x69, 16);
        let mut block = Vec::new();
        block.extend_from_slice(&DEVINFO_MAGIC.to_le_bytes());
        block.extend_from_slice(&1u32.to_le_bytes());
        block.extend_from_slice(&[0u8; 8]);
        mock.queue_response(&block);
        mock.queue_echo(0x69, 0);
    }

    /// Queue the PIT receive exchange for a small-packet session and
    /// return the table the "device" served.
    fn queue_pit_exchange(mock: &MockTransport) -> PitTable {
        let table = sample_pit();
        let wire = table.serialize();
        mock.queue_echo(0x65, wire.len() as i32);
        let mut padded = wire;
        let t = padded.len().div_ceil(500) * 500;
        padded.resize(t, 0);
        mock.queue_response(&padded);
        mock.queue_echo(0x65, 0);
        table
    }

    fn sample_entry(len: usize) -> FirmwareEntry {
        FirmwareEntry {
            filename: "system.img".to_string(),
            partition_name: "SYSTEM".to_string(),
            kind: PayloadKind::Ap,
            compression: Compression::None,
            size: len as u64,
            uncompressed_size: None,
            lz4: Default::default(),
            data: vec![0xAB; len].into(),
        }
    }

    #[test]
    fn handshake_accepts_loke() {
        let mock = MockTransport::new();
        mock.queue_response(b"LOKE");
        let package = FirmwarePackage::new();
        let mut engine = ProtocolEngine::new(&mock, &package, &OBS);

        engine.handshake().unwrap();
        assert_eq!(engine.state(), SessionState::Handshaken);
        assert_eq!(mock.writes()[0], b"ODIN");
    }

    #[test]
    fn handshake_rejects_other_reply() {
        let mock = MockTransport::new();
        mock.queue_response(b"NOPE");
        let package = FirmwarePackage::new();
        let mut engine = ProtocolEngine::new(&mock, &package, &OBS);

        let err = engine.download(false).unwrap_err();
        assert!(matches!(
            err,
            OdinError::Protocol(ProtocolError::HandshakeRejected { .. })
        ));
        assert_eq!(engine.state(), SessionState::Aborted);
        // No close attempt before the session existed.
        assert_eq!(mock.writes().len(), 1);
    }

    #[test]
    fn small_packet_session_keeps_default_size() {
        let mock = MockTransport::new();
        mock.queue_response(b"LOKE");
        mock.queue_echo(0x64, 0);
        let package = FirmwarePackage::new();
        let mut engine = ProtocolEngine::new(&mock, &package, &OBS);

        engine.handshake().unwrap();
        engine.begin_session().unwrap();

        assert_eq!(engine.packet_size(), DEFAULT_PACKET_SIZE);
        // ODIN greeting plus exactly one command packet: no SetPacketSize.
        let writes = mock.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(triple(&writes[1]), (0x64, 0, 0));
    }

    #[test]
    fn large_packet_session_negotiates_1mib() {
        let mock = MockTransport::new();
        mock.queue_response(b"LOKE");
        mock.queue_echo(0x64, 1);
        mock.queue_echo(0x64, 0); // SetPacketSize ack
        let package = FirmwarePackage::new();
        let mut engine = ProtocolEngine::new(&mock, &package, &OBS);

        engine.handshake().unwrap();
        engine.begin_session().unwrap();

        assert_eq!(engine.packet_size(), MAX_PACKET_SIZE);
        let writes = mock.writes();
        assert_eq!(writes[2].len(), CMD_PACKET_SIZE);
        assert_eq!(triple(&writes[2]), (0x64, 5, 0x0010_0000));
    }

    #[test]
    fn zlp_devices_query_total_bytes_advisory() {
        let mock = MockTransport::new().with_zlp(true);
        mock.queue_response(b"LOKE");
        mock.queue_echo(0x64, 0);
        mock.queue_echo(0x64, 123_456); // total bytes
        let package = FirmwarePackage::new();
        let mut engine = ProtocolEngine::new(&mock, &package, &OBS);

        engine.handshake().unwrap();
        engine.begin_session().unwrap();
        assert_eq!(triple(&mock.writes()[2]), (0x64, 2, 0));
    }

    #[test]
    fn erase_mode_failure_is_fatal() {
        let mock = MockTransport::new();
        mock.queue_response(b"LOKE");
        mock.queue_echo(0x64, 0);
        mock.queue_response(&[0u8; 4]); // truncated erase ack
        let mut package = FirmwarePackage::new();
        package.set_erase(true);
        let mut engine = ProtocolEngine::new(&mock, &package, &OBS);

        engine.handshake().unwrap();
        let err = engine.begin_session().unwrap_err();
        assert!(matches!(
            err,
            OdinError::Protocol(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn device_info_parses_magic_and_count() {
        let mock = MockTransport::new();
        mock.queue_echo(0x69, 16);
        let mut block = Vec::new();
        block.extend_from_slice(&DEVINFO_MAGIC.to_le_bytes());
        block.extend_from_slice(&2u32.to_le_bytes());
        block.extend_from_slice(&[0u8; 8]);
        mock.queue_response(&block);
        mock.queue_echo(0x69, 0);

        let package = FirmwarePackage::new();
        let mut engine = ProtocolEngine::new(&mock, &package, &OBS);
        engine.get_device_info().unwrap();
        assert!(engine.device_info_received());
    }

    #[test]
    fn device_info_rejects_bad_magic() {
        let mock = MockTransport::new();
        mock.queue_echo(0x69, 16);
        mock.queue_response(&[0xFFu8; 16]);

        let package = FirmwarePackage::new();
        let mut engine = ProtocolEngine::new(&mock, &package, &OBS);
        let err = engine.get_device_info().unwrap_err();
        assert!(matches!(
            err,
            OdinError::Protocol(ProtocolError::BadMagic { .. })
        ));
    }

    #[test]
    fn pit_receive_roundtrips_and_rounds_to_granule() {
        let mock = MockTransport::new();
        let package = FirmwarePackage::new();
        let mut engine = ProtocolEngine::new(&mock, &package, &OBS);
        let served = queue_pit_exchange(&mock);

        let received = engine.receive_pit().unwrap();
        assert_eq!(received, served);
        assert_eq!(engine.state(), SessionState::PitReceived);

        // 28 + 3*132 = 424 bytes rounds up to one 500-byte granule.
        let writes = mock.writes();
        assert_eq!(triple(&writes[0]), (0x65, 1, 0));
        assert_eq!(triple(&writes[1]), (0x65, 2, 500));
        assert_eq!(triple(&writes[2]), (0x65, 3, 0));
    }

    #[test]
    fn pit_receive_short_read_fails() {
        let mock = MockTransport::new();
        mock.queue_echo(0x65, 424);
        mock.queue_response(&[0u8; 100]); // short of the 500-byte granule

        let package = FirmwarePackage::new();
        let mut engine = ProtocolEngine::new(&mock, &package, &OBS);
        let err = engine.receive_pit().unwrap_err();
        assert!(matches!(
            err,
            OdinError::Transport(crate::transport::TransportError::ShortRead { .. })
        ));
    }

    #[test]
    fn send_pit_streams_file_in_packet_chunks() {
        let mut pit_file = tempfile::NamedTempFile::new().unwrap();
        pit_file.write_all(&[0x5Au8; 1200]).unwrap();
        pit_file.as_file_mut().flush().unwrap();

        let mut package = FirmwarePackage::new();
        package.set_pit(pit_file.path()).unwrap();

        let mock = MockTransport::new();
        mock.queue_echo(0x65, 0); // Start
        mock.queue_echo(0x65, 0); // Size
        mock.queue_echo(0x65, 0); // chunk 1 ack
        mock.queue_echo(0x65, 0); // chunk 2 ack
        mock.queue_echo(0x65, 0); // End

        let mut engine = ProtocolEngine::new(&mock, &package, &OBS);
        engine.send_pit().unwrap();
        assert_eq!(engine.state(), SessionState::Ready);

        let writes = mock.writes();
        assert_eq!(triple(&writes[0]), (0x65, 0, 0));
        assert_eq!(triple(&writes[1]), (0x65, 1, 1200));
        assert_eq!(writes[2].len(), 1024);
        assert_eq!(writes[3].len(), 176);
        assert_eq!(triple(&writes[4]), (0x65, 3, 0));
    }

    #[test]
    fn transfer_chunks_at_negotiated_packet_size() {
        let mock = MockTransport::new();
        mock.queue_response(b"LOKE");
        mock.queue_echo(0x64, 1);
        mock.queue_echo(0x64, 0);
        let package = FirmwarePackage::new();
        let mut engine = ProtocolEngine::new(&mock, &package, &OBS);
        engine.handshake().unwrap();
        engine.begin_session().unwrap();
        mock.clear_writes();

        // 3.5 MiB payload
        let entry = sample_entry(3 * 1024 * 1024 + 512 * 1024);
        mock.queue_echo(0x66, 0); // Start
        mock.queue_echo(0x66, 0); // SetInfo
        for _ in 0..4 {
            mock.queue_echo(0x66, 0); // per-chunk ack
        }
        mock.queue_echo(0x66, 0); // End

        engine.transfer_entry(&entry).unwrap();

        let sizes: Vec<usize> = mock.writes().iter().map(Vec::len).collect();
        assert_eq!(
            sizes,
            [
                CMD_PACKET_SIZE,
                CMD_PACKET_SIZE,
                1_048_576,
                1_048_576,
                1_048_576,
                524_288,
                CMD_PACKET_SIZE
            ]
        );
        let writes = mock.writes();
        assert_eq!(triple(&writes[1]), (0x66, 1, 3_670_016));
        assert_eq!(triple(&writes[6]), (0x66, 3, 0));
    }

    #[test]
    fn write_protect_failure_surfaces_and_closes() {
        let mock = MockTransport::new();
        mock.queue_response(b"LOKE");
        mock.queue_echo(0x64, 0);
        queue_device_info(&mock);
        queue_pit_exchange(&mock);
        mock.queue_echo(0x66, 0); // file transfer Start
        mock.queue_echo_extra(0xDEAD, 0, -5); // SetInfo: echo mismatch, Auth code

        let mut package = FirmwarePackage::new();
        package_with_entry(&mut package);
        let mut engine = ProtocolEngine::new(&mock, &package, &OBS);

        let err = engine.download(false).unwrap_err();
        assert!(matches!(
            err,
            OdinError::WriteProtect(WriteProtectKind::Auth)
        ));
        assert_eq!(engine.state(), SessionState::Aborted);

        // The last packet written is the best-effort close.
        let writes = mock.writes();
        assert_eq!(triple(writes.last().unwrap()), (0x67, 0, 0));
    }

    fn package_with_entry(package: &mut FirmwarePackage) {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0x11u8; 1024]).unwrap();
        f.as_file_mut().flush().unwrap();
        package.set_ap(f.path()).unwrap();
    }

    #[test]
    fn happy_path_terminates_closed() {
        let mock = MockTransport::new();
        mock.queue_response(b"LOKE");
        mock.queue_echo(0x64, 0);
        queue_device_info(&mock);
        queue_pit_exchange(&mock);
        mock.queue_echo(0x67, 0); // Close

        let package = FirmwarePackage::new();
        let mut engine = ProtocolEngine::new(&mock, &package, &OBS);
        engine.download(false).unwrap();
        assert_eq!(engine.state(), SessionState::Closed);
    }

    #[test]
    fn reboot_packet_follows_close_when_requested() {
        let mock = MockTransport::new();
        mock.queue_response(b"LOKE");
        mock.queue_echo(0x64, 0);
        queue_device_info(&mock);
        queue_pit_exchange(&mock);
        mock.queue_echo(0x67, 0); // Close

        let package = FirmwarePackage::new();
        let mut engine = ProtocolEngine::new(&mock, &package, &OBS);
        engine.download(true).unwrap();

        let writes = mock.writes();
        assert_eq!(triple(writes.last().unwrap()), (0x67, 1, 0));
        assert_eq!(engine.state(), SessionState::Closed);
    }

    #[test]
    fn redownload_issues_connection_redownload() {
        let mock = MockTransport::new();
        mock.queue_response(b"LOKE");
        mock.queue_echo(0x64, 0);
        mock.queue_echo(0x67, 0);

        let package = FirmwarePackage::new();
        let mut engine = ProtocolEngine::new(&mock, &package, &OBS);
        engine.redownload().unwrap();

        let writes = mock.writes();
        assert_eq!(triple(writes.last().unwrap()), (0x67, 2, 0));
        assert_eq!(engine.state(), SessionState::Closed);
    }

    #[test]
    fn transport_errors_abort_the_session() {
        let mock = MockTransport::new();
        mock.queue_response(b"LOKE");
        mock.queue_echo(0x64, 0);
        queue_device_info(&mock);
        queue_pit_exchange(&mock);
        // Nothing queued for file transfer: the Start command times out.

        let mut package = FirmwarePackage::new();
        package_with_entry(&mut package);
        let mut engine = ProtocolEngine::new(&mock, &package, &OBS);

        let err = engine.download(false).unwrap_err();
        assert!(matches!(err, OdinError::Transport(_)));
        assert_eq!(engine.state(), SessionState::Aborted);
    }
}
