//! Random-access reader over a POSIX ustar archive.
//!
//! Firmware packages ship as plain tar files; entries are indexed once
//! and their bytes are read on demand by seeking to the recorded data
//! offset, so a multi-gigabyte archive is never held in memory whole.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::debug;

use super::PackageError;

/// Header/data block granularity.
pub const TAR_BLOCK_SIZE: usize = 512;

const NAME_LEN: usize = 100;
const PREFIX_OFFSET: usize = 345;
const PREFIX_LEN: usize = 155;
const MODE_OFFSET: usize = 100;
const SIZE_OFFSET: usize = 124;
const MTIME_OFFSET: usize = 136;
const TYPEFLAG_OFFSET: usize = 156;
const MAGIC_OFFSET: usize = 257;

/// Whether a 512-byte header block (or a file's first block) carries the
/// ustar magic.
pub fn is_ustar(header: &[u8]) -> bool {
    header.len() >= MAGIC_OFFSET + 5 && &header[MAGIC_OFFSET..MAGIC_OFFSET + 5] == b"ustar"
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone)]
pub struct TarEntry {
    pub name: String,
    pub size: u64,
    /// Offset of the entry's data in the archive, a multiple of 512.
    pub offset: u64,
    pub mode: u32,
    pub mtime: u64,
    pub kind: EntryKind,
}

impl TarEntry {
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// Indexed ustar archive backed by a seekable file.
pub struct TarReader {
    file: File,
    entries: Vec<TarEntry>,
}

impl TarReader {
    /// Open an archive and index its entries.
    pub fn open(path: &Path) -> Result<Self, PackageError> {
        let mut file = File::open(path)?;
        let mut entries = Vec::new();
        let mut offset: u64 = 0;
        let mut header = [0u8; TAR_BLOCK_SIZE];

        loop {
            match file.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            // End of archive is marked by an all-zero block.
            if header.iter().all(|&b| b == 0) {
                break;
            }

            let parsed = parse_header(&header, offset + TAR_BLOCK_SIZE as u64)?;
            let data_blocks = parsed.size.div_ceil(TAR_BLOCK_SIZE as u64);
            let skip = data_blocks * TAR_BLOCK_SIZE as u64;

            if let Some(entry) = parsed.entry {
                entries.push(entry);
            }

            file.seek(SeekFrom::Current(skip as i64))?;
            offset += TAR_BLOCK_SIZE as u64 + skip;
        }

        debug!(path = %path.display(), entries = entries.len(), "Indexed tar archive");
        Ok(Self { file, entries })
    }

    pub fn entries(&self) -> &[TarEntry] {
        &self.entries
    }

    /// Find an entry by full name or basename.
    pub fn find_entry(&self, name: &str) -> Option<&TarEntry> {
        self.entries
            .iter()
            .find(|e| e.name == name || e.name.rsplit('/').next() == Some(name))
    }

    /// Read an entry's bytes into `buf` (which must hold `entry.size`).
    pub fn read_entry(&mut self, entry: &TarEntry, buf: &mut [u8]) -> Result<(), PackageError> {
        let size = entry.size as usize;
        if buf.len() < size {
            return Err(PackageError::TarFormat(format!(
                "buffer too small for {}: {} < {}",
                entry.name,
                buf.len(),
                size
            )));
        }
        self.file.seek(SeekFrom::Start(entry.offset))?;
        self.file.read_exact(&mut buf[..size])?;
        Ok(())
    }
}

/// One parsed header block: the data size (always needed to skip the
/// data region) plus the entry record, absent for entry types ignored
/// for payload purposes.
struct ParsedHeader {
    size: u64,
    entry: Option<TarEntry>,
}

fn parse_header(header: &[u8; TAR_BLOCK_SIZE], data_offset: u64) -> Result<ParsedHeader, PackageError> {
    // Accept ustar headers and the pre-POSIX format some packagers emit.
    if !is_ustar(header) && header[0] == 0 {
        return Err(PackageError::TarFormat(
            "header block is neither ustar nor old-style tar".to_string(),
        ));
    }

    let mut name = trimmed_field(&header[..NAME_LEN]);
    let prefix = trimmed_field(&header[PREFIX_OFFSET..PREFIX_OFFSET + PREFIX_LEN]);
    if !prefix.is_empty() {
        name = format!("{prefix}/{name}");
    }

    let size = parse_octal(&header[SIZE_OFFSET..SIZE_OFFSET + 12]);
    let mode = parse_octal(&header[MODE_OFFSET..MODE_OFFSET + 8]) as u32;
    let mtime = parse_octal(&header[MTIME_OFFSET..MTIME_OFFSET + 12]);

    let kind = match header[TYPEFLAG_OFFSET] {
        b'0' | 0 => Some(EntryKind::File),
        b'5' => Some(EntryKind::Directory),
        _ => None,
    };

    Ok(ParsedHeader {
        size,
        entry: kind.map(|kind| TarEntry {
            name,
            size,
            offset: data_offset,
            mode,
            mtime,
            kind,
        }),
    })
}

fn trimmed_field(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Octal numeric field, terminated by NUL or space.
fn parse_octal(field: &[u8]) -> u64 {
    let mut value = 0u64;
    for &b in field {
        match b {
            b'0'..=b'7' => value = (value << 3) + u64::from(b - b'0'),
            0 | b' ' => break,
            _ => break,
        }
    }
    value
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Build a minimal ustar header block with a valid checksum field.
    pub(crate) fn make_header(name: &str, size: u64, typeflag: u8) -> [u8; TAR_BLOCK_SIZE] {
        let mut h = [0u8; TAR_BLOCK_SIZE];
        h[..name.len()].copy_from_slice(name.as_bytes());
        h[MODE_OFFSET..MODE_OFFSET + 7].copy_from_slice(b"0000644");
        h[108..115].copy_from_slice(b"0000000"); // uid
        h[116..123].copy_from_slice(b"0000000"); // gid
        let size_field = format!("{size:011o} ");
        h[SIZE_OFFSET..SIZE_OFFSET + 12].copy_from_slice(size_field.as_bytes());
        h[MTIME_OFFSET..MTIME_OFFSET + 12].copy_from_slice(b"14371573652 ");
        h[TYPEFLAG_OFFSET] = typeflag;
        h[MAGIC_OFFSET..MAGIC_OFFSET + 6].copy_from_slice(b"ustar\0");
        h[263..265].copy_from_slice(b"00");

        // Checksum computed with the checksum field set to spaces.
        h[148..156].copy_from_slice(b"        ");
        let sum: u32 = h.iter().map(|&b| u32::from(b)).sum();
        let checksum = format!("{sum:06o}\0 ");
        h[148..156].copy_from_slice(checksum.as_bytes());
        h
    }

    /// Build an archive of (name, content, typeflag) triples.
    pub(crate) fn make_tar(entries: &[(&str, &[u8], u8)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, content, typeflag) in entries {
            out.extend_from_slice(&make_header(name, content.len() as u64, *typeflag));
            out.extend_from_slice(content);
            let pad = content.len().next_multiple_of(TAR_BLOCK_SIZE) - content.len();
            out.extend(std::iter::repeat_n(0u8, pad));
        }
        out.extend(std::iter::repeat_n(0u8, 2 * TAR_BLOCK_SIZE));
        out
    }

    fn write_temp(bytes: &[u8]) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f.as_file_mut().flush().unwrap();
        f
    }

    #[test]
    fn indexes_entries_with_aligned_offsets() {
        let a = vec![0xAAu8; 700];
        let b = vec![0xBBu8; 512];
        let tar = make_tar(&[("boot.img", &a, b'0'), ("modem.bin", &b, b'0')]);
        let f = write_temp(&tar);

        let reader = TarReader::open(f.path()).unwrap();
        let entries = reader.entries();
        assert_eq!(entries.len(), 2);

        assert_eq!(entries[0].name, "boot.img");
        assert_eq!(entries[0].size, 700);
        assert_eq!(entries[0].offset, 512);

        assert_eq!(entries[1].name, "modem.bin");
        // 512 header + 1024 padded data for the first entry, then header
        assert_eq!(entries[1].offset, 2048);

        for e in entries {
            assert_eq!(e.offset % TAR_BLOCK_SIZE as u64, 0);
        }
    }

    #[test]
    fn reads_entry_bytes_back() {
        let content: Vec<u8> = (0..1500u32).map(|i| i as u8).collect();
        let tar = make_tar(&[("sub/system.img", &content, b'0')]);
        let f = write_temp(&tar);

        let mut reader = TarReader::open(f.path()).unwrap();
        let entry = reader.entries()[0].clone();
        let mut buf = vec![0u8; entry.size as usize];
        reader.read_entry(&entry, &mut buf).unwrap();
        assert_eq!(buf, content);
    }

    #[test]
    fn directories_and_files_are_distinguished() {
        let tar = make_tar(&[("firmware/", b"", b'5'), ("firmware/cache.img", b"xy", b'0')]);
        let f = write_temp(&tar);

        let reader = TarReader::open(f.path()).unwrap();
        assert_eq!(reader.entries()[0].kind, EntryKind::Directory);
        assert!(reader.entries()[1].is_file());
    }

    #[test]
    fn prefix_field_joins_with_slash() {
        let mut h = make_header("recovery.img", 0, b'0');
        h[PREFIX_OFFSET..PREFIX_OFFSET + 8].copy_from_slice(b"firmware");
        let mut tar = h.to_vec();
        tar.extend(std::iter::repeat_n(0u8, 2 * TAR_BLOCK_SIZE));
        let f = write_temp(&tar);

        let reader = TarReader::open(f.path()).unwrap();
        assert_eq!(reader.entries()[0].name, "firmware/recovery.img");
    }

    #[test]
    fn find_entry_matches_basename() {
        let tar = make_tar(&[("images/boot.img", b"abc", b'0')]);
        let f = write_temp(&tar);

        let reader = TarReader::open(f.path()).unwrap();
        assert!(reader.find_entry("images/boot.img").is_some());
        assert!(reader.find_entry("boot.img").is_some());
        assert!(reader.find_entry("missing.img").is_none());
    }

    #[test]
    fn stops_at_zero_block() {
        let mut tar = make_tar(&[("a.bin", b"1234", b'0')]);
        // Garbage after the terminating zero blocks must not be parsed.
        tar.extend_from_slice(&[0xFFu8; 512]);
        let f = write_temp(&tar);

        let reader = TarReader::open(f.path()).unwrap();
        assert_eq!(reader.entries().len(), 1);
    }
}
