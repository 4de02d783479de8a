//! LZ4 frame header sniffing.
//!
//! Compressed payloads are transmitted byte-for-byte and decompressed by
//! the device, so only the frame descriptor is parsed here. The one-byte
//! header checksum terminating the descriptor is not verified; the
//! device is authoritative.

/// LZ4 frame magic (little-endian on the wire: `04 22 4D 18`).
pub const LZ4_MAGIC: u32 = 0x184D2204;

/// Parsed LZ4 frame descriptor bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Lz4FrameInfo {
    pub independent_blocks: bool,
    pub block_checksum: bool,
    pub content_checksum: bool,
    /// Block maximum size id, 0..=7.
    pub block_size_id: u8,
    /// Uncompressed size, present only when the frame carries it.
    pub content_size: Option<u64>,
}

/// Whether the buffer starts with the LZ4 frame magic.
pub fn is_lz4(data: &[u8]) -> bool {
    data.len() >= 4 && u32::from_le_bytes([data[0], data[1], data[2], data[3]]) == LZ4_MAGIC
}

/// Parse the frame header from the first bytes of a stream.
///
/// Returns `None` when the magic does not match or the header is
/// truncated. No block data is decoded.
pub fn sniff(data: &[u8]) -> Option<Lz4FrameInfo> {
    if !is_lz4(data) || data.len() < 6 {
        return None;
    }

    let flg = data[4];
    let bd = data[5];

    let content_size_present = (flg & 0x08) != 0;
    let content_size = if content_size_present {
        if data.len() < 14 {
            return None;
        }
        Some(u64::from_le_bytes(data[6..14].try_into().unwrap()))
    } else {
        None
    };

    Some(Lz4FrameInfo {
        independent_blocks: (flg & 0x20) != 0,
        block_checksum: (flg & 0x10) != 0,
        content_checksum: (flg & 0x04) != 0,
        block_size_id: (bd >> 4) & 0x07,
        content_size,
    })
}
