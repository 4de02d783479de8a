//! Partition Information Table codec.
//!
//! The PIT is the device's authoritative partition map: a 28-byte header
//! (magic, entry count, gang and project names) followed by N fixed
//! 132-byte entries. All integers are little-endian; strings are
//! NUL-padded within fixed-width fields and may fill them exactly.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use thiserror::Error;
use tracing::info;

/// PIT file magic.
pub const PIT_MAGIC: u32 = 0x12349876;
/// Header size on the wire.
pub const PIT_HEADER_SIZE: usize = 28;
/// Per-entry size on the wire.
pub const PIT_ENTRY_SIZE: usize = 132;

const GANG_NAME_LEN: usize = 8;
const PROJECT_NAME_LEN: usize = 8;
const NAME_FIELD_LEN: usize = 32;

/// Partition attribute bits.
pub const ATTR_WRITE: u32 = 0x01;
pub const ATTR_STL: u32 = 0x02;
pub const ATTR_BML: u32 = 0x04;

#[derive(Error, Debug)]
pub enum PitError {
    #[error("invalid PIT magic: 0x{0:08X}")]
    InvalidMagic(u32),

    #[error("PIT truncated: {actual} bytes, need {expected}")]
    Truncated { actual: usize, expected: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which processor a partition belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryType {
    Ap,
    Cp,
    Other(u32),
}

impl BinaryType {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => BinaryType::Ap,
            1 => BinaryType::Cp,
            other => BinaryType::Other(other),
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            BinaryType::Ap => 0,
            BinaryType::Cp => 1,
            BinaryType::Other(raw) => raw,
        }
    }
}

/// Storage device class a partition lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    OneNand,
    Nand,
    Mmc,
    All,
    Ufs,
    Other(u32),
}

impl DeviceType {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => DeviceType::OneNand,
            1 => DeviceType::Nand,
            2 => DeviceType::Mmc,
            3 => DeviceType::All,
            4 => DeviceType::Ufs,
            other => DeviceType::Other(other),
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            DeviceType::OneNand => 0,
            DeviceType::Nand => 1,
            DeviceType::Mmc => 2,
            DeviceType::All => 3,
            DeviceType::Ufs => 4,
            DeviceType::Other(raw) => raw,
        }
    }
}

/// One partition record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PitEntry {
    pub binary_type: BinaryType,
    pub device_type: DeviceType,
    pub partition_id: u32,
    pub attributes: u32,
    pub update_attributes: u32,
    /// Interpretation is device-dependent (block size or start offset).
    pub block_size_or_offset: u32,
    pub block_count: u32,
    pub file_offset: u32,
    pub file_size: u32,
    pub partition_name: String,
    pub flash_filename: String,
    pub fota_filename: String,
}

impl Default for PitEntry {
    fn default() -> Self {
        Self {
            binary_type: BinaryType::Ap,
            device_type: DeviceType::Mmc,
            partition_id: 0,
            attributes: 0,
            update_attributes: 0,
            block_size_or_offset: 0,
            block_count: 0,
            file_offset: 0,
            file_size: 0,
            partition_name: String::new(),
            flash_filename: String::new(),
            fota_filename: String::new(),
        }
    }
}

/// A parsed Partition Information Table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PitTable {
    pub gang_name: String,
    pub project_name: String,
    pub entries: Vec<PitEntry>,
}

impl PitTable {
    /// Parse a PIT from its wire form.
    pub fn parse(data: &[u8]) -> Result<Self, PitError> {
        if data.len() < PIT_HEADER_SIZE {
            return Err(PitError::Truncated {
                actual: data.len(),
                expected: PIT_HEADER_SIZE,
            });
        }

        let mut cursor = Cursor::new(data);
        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != PIT_MAGIC {
            return Err(PitError::InvalidMagic(magic));
        }

        let count = cursor.read_u32::<LittleEndian>()? as usize;
        let expected = PIT_HEADER_SIZE + PIT_ENTRY_SIZE * count;
        if data.len() < expected {
            return Err(PitError::Truncated {
                actual: data.len(),
                expected,
            });
        }

        let gang_name = fixed_str(&data[8..8 + GANG_NAME_LEN]);
        let project_name = fixed_str(&data[16..16 + PROJECT_NAME_LEN]);

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let base = PIT_HEADER_SIZE + i * PIT_ENTRY_SIZE;
            entries.push(Self::parse_entry(&data[base..base + PIT_ENTRY_SIZE])?);
        }

        Ok(Self {
            gang_name,
            project_name,
            entries,
        })
    }

    fn parse_entry(raw: &[u8]) -> Result<PitEntry, PitError> {
        let mut cursor = Cursor::new(raw);
        Ok(PitEntry {
            binary_type: BinaryType::from_raw(cursor.read_u32::<LittleEndian>()?),
            device_type: DeviceType::from_raw(cursor.read_u32::<LittleEndian>()?),
            partition_id: cursor.read_u32::<LittleEndian>()?,
            attributes: cursor.read_u32::<LittleEndian>()?,
            update_attributes: cursor.read_u32::<LittleEndian>()?,
            block_size_or_offset: cursor.read_u32::<LittleEndian>()?,
            block_count: cursor.read_u32::<LittleEndian>()?,
            file_offset: cursor.read_u32::<LittleEndian>()?,
            file_size: cursor.read_u32::<LittleEndian>()?,
            partition_name: fixed_str(&raw[36..36 + NAME_FIELD_LEN]),
            flash_filename: fixed_str(&raw[68..68 + NAME_FIELD_LEN]),
            fota_filename: fixed_str(&raw[100..100 + NAME_FIELD_LEN]),
        })
    }

    /// Serialize to the exact `28 + 132·N` wire form.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.wire_len()];

        let mut cursor = Cursor::new(&mut buf[..8]);
        cursor.write_u32::<LittleEndian>(PIT_MAGIC).unwrap();
        cursor
            .write_u32::<LittleEndian>(self.entries.len() as u32)
            .unwrap();
        write_fixed_str(&mut buf[8..8 + GANG_NAME_LEN], &self.gang_name);
        write_fixed_str(&mut buf[16..16 + PROJECT_NAME_LEN], &self.project_name);
        // bytes 24..28 reserved, left zero

        for (i, entry) in self.entries.iter().enumerate() {
            let base = PIT_HEADER_SIZE + i * PIT_ENTRY_SIZE;
            let raw = &mut buf[base..base + PIT_ENTRY_SIZE];
            {
                let mut cursor = Cursor::new(&mut raw[..36]);
                cursor
                    .write_u32::<LittleEndian>(entry.binary_type.to_raw())
                    .unwrap();
                cursor
                    .write_u32::<LittleEndian>(entry.device_type.to_raw())
                    .unwrap();
                cursor.write_u32::<LittleEndian>(entry.partition_id).unwrap();
                cursor.write_u32::<LittleEndian>(entry.attributes).unwrap();
                cursor
                    .write_u32::<LittleEndian>(entry.update_attributes)
                    .unwrap();
                cursor
                    .write_u32::<LittleEndian>(entry.block_size_or_offset)
                    .unwrap();
                cursor.write_u32::<LittleEndian>(entry.block_count).unwrap();
                cursor.write_u32::<LittleEndian>(entry.file_offset).unwrap();
                cursor.write_u32::<LittleEndian>(entry.file_size).unwrap();
            }
            write_fixed_str(&mut raw[36..36 + NAME_FIELD_LEN], &entry.partition_name);
            write_fixed_str(&mut raw[68..68 + NAME_FIELD_LEN], &entry.flash_filename);
            write_fixed_str(&mut raw[100..100 + NAME_FIELD_LEN], &entry.fota_filename);
        }

        buf
    }

    /// Total serialized length.
    pub fn wire_len(&self) -> usize {
        PIT_HEADER_SIZE + PIT_ENTRY_SIZE * self.entries.len()
    }

    /// First entry whose partition name matches exactly.
    pub fn find_entry(&self, partition_name: &str) -> Option<&PitEntry> {
        self.entries
            .iter()
            .find(|e| e.partition_name == partition_name)
    }

    /// First entry whose flash filename or FOTA filename matches.
    pub fn find_entry_by_filename(&self, filename: &str) -> Option<&PitEntry> {
        self.entries
            .iter()
            .find(|e| e.flash_filename == filename || e.fota_filename == filename)
    }

    /// Log the table the way the interactive tool prints it.
    pub fn log_summary(&self) {
        info!(
            gang = %self.gang_name,
            project = %self.project_name,
            entries = self.entries.len(),
            "PIT"
        );
        for (i, e) in self.entries.iter().enumerate() {
            info!(
                "  [{i}] {} -> {} (ID={}, {} blocks)",
                e.partition_name, e.flash_filename, e.partition_id, e.block_count
            );
        }
    }
}

/// Take a fixed-width field up to its length or the first NUL,
/// whichever is shorter.
fn fixed_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn write_fixed_str(field: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(field.len());
    field[..n].copy_from_slice(&bytes[..n]);
}
