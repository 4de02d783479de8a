//! Protocol module - Odin wire protocol definitions.

pub mod constants;
pub mod packet;

pub use constants::*;
pub use packet::{CmdPacket, CmdResponse, ProtocolError, WriteProtectKind};
