//! Command packet encoding and response parsing.
//!
//! Every outbound command is a fixed `0x800`-byte packet carrying three
//! little-endian u32 fields (command, sub-command, argument) at offsets
//! 0, 4 and 8, zero-padded to packet length. Responses echo the command
//! at offset 0, carry a scalar at offset 4, and optionally a second
//! scalar (or a negative write-protection code) at offset 8.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::Cursor;
use thiserror::Error;

use super::constants::{Cmd, CMD_PACKET_SIZE};

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("response truncated: {actual} bytes, need at least {expected}")]
    Truncated { actual: usize, expected: usize },

    #[error("short write: {written}/{expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("unexpected command echo: sent 0x{sent:02X}, got 0x{got:02X}")]
    UnexpectedEcho { sent: u32, got: u32 },

    #[error("handshake rejected: device replied {reply:?}")]
    HandshakeRejected { reply: String },

    #[error("invalid {context} magic: 0x{magic:08X}")]
    BadMagic { context: &'static str, magic: u32 },

    #[error("invalid {context}: {value}")]
    InvalidSize { context: &'static str, value: i64 },
}

/// Write-protection failure classes carried as a negative scalar at
/// offset 8 of a non-echo response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteProtectKind {
    Ext4,
    Size,
    Auth,
    Write,
    Erase,
    Unknown(i32),
}

impl From<i32> for WriteProtectKind {
    fn from(code: i32) -> Self {
        match code {
            -7 => WriteProtectKind::Ext4,
            -6 => WriteProtectKind::Size,
            -5 => WriteProtectKind::Auth,
            -4 => WriteProtectKind::Write,
            -3 => WriteProtectKind::Erase,
            other => WriteProtectKind::Unknown(other),
        }
    }
}

impl fmt::Display for WriteProtectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteProtectKind::Ext4 => write!(f, "FAIL! (Ext4)"),
            WriteProtectKind::Size => write!(f, "FAIL! (Size)"),
            WriteProtectKind::Auth => write!(f, "FAIL! (Auth)"),
            WriteProtectKind::Write => write!(f, "FAIL! (Write)"),
            WriteProtectKind::Erase => write!(f, "FAIL! (Erase)"),
            WriteProtectKind::Unknown(code) => write!(f, "FAIL! (Unknown: {code})"),
        }
    }
}

/// An outbound command packet.
#[derive(Debug, Clone, Copy)]
pub struct CmdPacket {
    pub cmd: Cmd,
    pub sub: u32,
    pub arg: u32,
}

impl CmdPacket {
    pub fn new(cmd: Cmd, sub: u32, arg: u32) -> Self {
        Self { cmd, sub, arg }
    }

    /// Encode to the fixed `0x800`-byte wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; CMD_PACKET_SIZE];
        let mut cursor = Cursor::new(&mut buf[..]);
        cursor.write_u32::<LittleEndian>(self.cmd.raw()).unwrap();
        cursor.write_u32::<LittleEndian>(self.sub).unwrap();
        cursor.write_u32::<LittleEndian>(self.arg).unwrap();
        buf
    }
}

/// A parsed device response.
///
/// The two `requestAndResponse` shapes of the protocol overlap at offset
/// 8 (optional second scalar vs. error code), so the response is modeled
/// as a tagged variant instead of positional integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdResponse {
    /// Well-formed echo of the command we sent.
    Echo {
        cmd: u32,
        value: i32,
        extra: Option<i32>,
    },
    /// Echo mismatch carrying a negative failure code at offset 8.
    Fail { code: i32 },
}

impl CmdResponse {
    /// Parse a raw response against the command that was sent.
    ///
    /// Responses shorter than 8 bytes fail. An echo mismatch with a
    /// negative scalar at offset 8 is a `Fail`; a mismatch without one
    /// is a protocol error.
    pub fn parse(buf: &[u8], sent: Cmd) -> Result<Self, ProtocolError> {
        if buf.len() < 8 {
            return Err(ProtocolError::Truncated {
                actual: buf.len(),
                expected: 8,
            });
        }

        let mut cursor = Cursor::new(buf);
        let cmd = cursor.read_u32::<LittleEndian>().unwrap();
        let value = cursor.read_i32::<LittleEndian>().unwrap();
        let extra = if buf.len() >= 12 {
            Some(cursor.read_i32::<LittleEndian>().unwrap())
        } else {
            None
        };

        if cmd != sent.raw() {
            if let Some(code) = extra
                && code < 0
            {
                return Ok(CmdResponse::Fail { code });
            }
            return Err(ProtocolError::UnexpectedEcho {
                sent: sent.raw(),
                got: cmd,
            });
        }

        Ok(CmdResponse::Echo { cmd, value, extra })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{LittleEndian, ReadBytesExt};
    use std::io::Cursor;

    #[test]
    fn packet_is_always_fixed_size() {
        for arg in [0u32, 1, 0x400, 0x0010_0000, u32::MAX] {
            let bytes = CmdPacket::new(Cmd::SessionControl, 5, arg).to_bytes();
            assert_eq!(bytes.len(), CMD_PACKET_SIZE);
        }
    }

    #[test]
    fn packet_roundtrips_triple() {
        let bytes = CmdPacket::new(Cmd::FileTransfer, 1, 0x0010_0000).to_bytes();
        let mut cursor = Cursor::new(&bytes[..]);
        assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), 0x66);
        assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), 1);
        assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), 0x0010_0000);
        assert!(bytes[12..].iter().all(|&b| b == 0));
    }

    fn echo_bytes(cmd: u32, value: i32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&cmd.to_le_bytes());
        buf.extend_from_slice(&value.to_le_bytes());
        buf
    }

    #[test]
    fn parses_plain_echo() {
        let buf = echo_bytes(0x64, 1);
        let resp = CmdResponse::parse(&buf, Cmd::SessionControl).unwrap();
        assert_eq!(
            resp,
            CmdResponse::Echo {
                cmd: 0x64,
                value: 1,
                extra: None
            }
        );
    }

    #[test]
    fn parses_echo_with_extra_scalar() {
        let mut buf = echo_bytes(0x65, 2048);
        buf.extend_from_slice(&7i32.to_le_bytes());
        let resp = CmdResponse::parse(&buf, Cmd::Pit).unwrap();
        assert_eq!(
            resp,
            CmdResponse::Echo {
                cmd: 0x65,
                value: 2048,
                extra: Some(7)
            }
        );
    }

    #[test]
    fn mismatched_echo_with_negative_code_is_fail() {
        let mut buf = echo_bytes(0xFFFF, 0);
        buf.extend_from_slice(&(-5i32).to_le_bytes());
        let resp = CmdResponse::parse(&buf, Cmd::FileTransfer).unwrap();
        assert_eq!(resp, CmdResponse::Fail { code: -5 });
        assert_eq!(WriteProtectKind::from(-5), WriteProtectKind::Auth);
    }

    #[test]
    fn mismatched_echo_without_code_is_error() {
        let buf = echo_bytes(0xFFFF, 0);
        let err = CmdResponse::parse(&buf, Cmd::FileTransfer).unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedEcho { .. }));
    }

    #[test]
    fn short_response_is_truncated() {
        let err = CmdResponse::parse(&[0x64, 0, 0], Cmd::SessionControl).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { actual: 3, .. }));
    }

    #[test]
    fn write_protect_codes_map() {
        assert_eq!(WriteProtectKind::from(-7), WriteProtectKind::Ext4);
        assert_eq!(WriteProtectKind::from(-6), WriteProtectKind::Size);
        assert_eq!(WriteProtectKind::from(-4), WriteProtectKind::Write);
        assert_eq!(WriteProtectKind::from(-3), WriteProtectKind::Erase);
        assert_eq!(WriteProtectKind::from(-99), WriteProtectKind::Unknown(-99));
    }
}
