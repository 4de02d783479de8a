//! Firmware package ingest pipeline.
//!
//! Given the per-class file paths from the front-end, the ingestor
//! classifies each file by magic bytes, decomposes archives into one
//! `FirmwareEntry` per partition payload, assigns partition names and
//! verifies integrity envelopes before anything touches the device.

pub mod gzip;
pub mod hash;
pub mod lz4;
pub mod tar;

pub use lz4::Lz4FrameInfo;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use self::tar::TarReader;

#[derive(Error, Debug)]
pub enum PackageError {
    #[error("tar format error: {0}")]
    TarFormat(String),

    #[error("integrity check failed for {path}: expected {expected}, computed {actual}")]
    IntegrityMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("PIT file is empty: {0}")]
    EmptyPit(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which payload class a file was supplied as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Bootloader,
    Ap,
    Cp,
    Csc,
    Ums,
    Pit,
}

/// On-wire compression of an entry's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Lz4,
    Gzip,
}

/// An identified payload destined for one partition.
///
/// The buffer holds the on-wire form: for `Lz4` it starts with the
/// frame magic and is transmitted byte-for-byte, for `None` the raw
/// image bytes with no framing.
#[derive(Debug, Clone)]
pub struct FirmwareEntry {
    pub filename: String,
    pub partition_name: String,
    pub kind: PayloadKind,
    pub compression: Compression,
    /// On-wire byte length (compressed length for LZ4 entries).
    pub size: u64,
    /// Known only when the LZ4 frame header carries it.
    pub uncompressed_size: Option<u64>,
    pub lz4: Lz4FrameInfo,
    pub data: Arc<[u8]>,
}

/// Top-level package ingestor.
#[derive(Debug, Clone, Default)]
pub struct FirmwarePackage {
    entries: Vec<FirmwareEntry>,
    pit_path: Option<PathBuf>,
    pit_size: u64,
    erase: bool,
    expected_sha256: Option<String>,
}

impl FirmwarePackage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_bootloader<P: AsRef<Path>>(&mut self, path: P) -> Result<(), PackageError> {
        self.add_payload(path.as_ref(), PayloadKind::Bootloader)
    }

    pub fn set_ap<P: AsRef<Path>>(&mut self, path: P) -> Result<(), PackageError> {
        self.add_payload(path.as_ref(), PayloadKind::Ap)
    }

    pub fn set_cp<P: AsRef<Path>>(&mut self, path: P) -> Result<(), PackageError> {
        self.add_payload(path.as_ref(), PayloadKind::Cp)
    }

    pub fn set_csc<P: AsRef<Path>>(&mut self, path: P) -> Result<(), PackageError> {
        self.add_payload(path.as_ref(), PayloadKind::Csc)
    }

    pub fn set_ums<P: AsRef<Path>>(&mut self, path: P) -> Result<(), PackageError> {
        self.add_payload(path.as_ref(), PayloadKind::Ums)
    }

    /// Record the PIT file for validation / send. The file is streamed
    /// during the PIT send phase, not loaded here.
    pub fn set_pit<P: AsRef<Path>>(&mut self, path: P) -> Result<(), PackageError> {
        let path = path.as_ref();
        let len = std::fs::metadata(path)?.len();
        if len == 0 {
            return Err(PackageError::EmptyPit(path.to_path_buf()));
        }
        info!(path = %path.display(), bytes = len, "PIT file set");
        self.pit_path = Some(path.to_path_buf());
        self.pit_size = len;
        Ok(())
    }

    pub fn set_erase(&mut self, enable: bool) {
        info!(enable, "NAND erase option");
        self.erase = enable;
    }

    /// Expected SHA-256 for `.sha256` envelopes, supplied out of band.
    pub fn set_expected_sha256(&mut self, hex: String) {
        self.expected_sha256 = Some(hex);
    }

    pub fn entries(&self) -> &[FirmwareEntry] {
        &self.entries
    }

    pub fn is_erase(&self) -> bool {
        self.erase
    }

    pub fn pit_path(&self) -> Option<&Path> {
        self.pit_path.as_deref()
    }

    pub fn pit_size(&self) -> u64 {
        self.pit_size
    }

    fn add_payload(&mut self, path: &Path, kind: PayloadKind) -> Result<(), PackageError> {
        info!(path = %path.display(), ?kind, "Ingesting payload");

        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("md5") => self.verify_md5_envelope(path)?,
            Some(ext) if ext.eq_ignore_ascii_case("sha256") => self.verify_sha256(path)?,
            _ => {}
        }

        self.ingest_container(path, kind)
    }

    /// Classify a file by its first 512 bytes and route it.
    fn ingest_container(&mut self, path: &Path, kind: PayloadKind) -> Result<(), PackageError> {
        let mut head = Vec::with_capacity(512);
        File::open(path)?.take(512).read_to_end(&mut head)?;

        if gzip::is_gzip(&head) {
            let temp = gzip::inflate_to_temp(path)?;
            return self.ingest_container(temp.path(), kind);
        }
        if lz4::is_lz4(&head) {
            return self.ingest_lz4_file(path, kind);
        }
        if tar::is_ustar(&head) {
            return self.ingest_tar(path, kind);
        }
        self.ingest_raw(path, kind)
    }

    /// A standalone LZ4 frame is loaded whole and streamed compressed;
    /// the device decodes it using the descriptor bits in the header.
    fn ingest_lz4_file(&mut self, path: &Path, kind: PayloadKind) -> Result<(), PackageError> {
        let data = std::fs::read(path)?;
        let frame = lz4::sniff(&data).unwrap_or_default();
        let filename = basename(path);
        self.push_entry(filename, kind, Compression::Lz4, frame, data);
        Ok(())
    }

    fn ingest_tar(&mut self, path: &Path, kind: PayloadKind) -> Result<(), PackageError> {
        let mut reader = TarReader::open(path)?;
        let entries = reader.entries().to_vec();
        info!(path = %path.display(), entries = entries.len(), "Tar archive");

        for entry in entries {
            if !entry.is_file() || entry.size == 0 {
                continue;
            }
            let lower = entry.name.to_ascii_lowercase();
            if lower.contains(".md5") || lower.contains(".sha256") {
                continue;
            }

            let mut buf = vec![0u8; entry.size as usize];
            reader.read_entry(&entry, &mut buf)?;

            let (compression, frame) = match lz4::sniff(&buf) {
                Some(frame) => (Compression::Lz4, frame),
                None => (Compression::None, Lz4FrameInfo::default()),
            };
            self.push_entry(entry.name.clone(), kind, compression, frame, buf);
        }
        Ok(())
    }

    /// Anything without a recognized container is a raw partition image.
    fn ingest_raw(&mut self, path: &Path, kind: PayloadKind) -> Result<(), PackageError> {
        let data = std::fs::read(path)?;
        let filename = basename(path);
        self.push_entry(
            filename,
            kind,
            Compression::None,
            Lz4FrameInfo::default(),
            data,
        );
        Ok(())
    }

    fn push_entry(
        &mut self,
        filename: String,
        kind: PayloadKind,
        compression: Compression,
        frame: Lz4FrameInfo,
        data: Vec<u8>,
    ) {
        let partition_name = derive_partition_name(&filename);
        let kind = if partition_name == "PIT" {
            PayloadKind::Pit
        } else {
            kind
        };
        info!(
            file = %filename,
            partition = %partition_name,
            bytes = data.len(),
            ?compression,
            "Entry"
        );
        self.entries.push(FirmwareEntry {
            filename,
            partition_name,
            kind,
            compression,
            size: data.len() as u64,
            uncompressed_size: frame.content_size,
            lz4: frame,
            data: data.into(),
        });
    }

    /// Verify the appended-digest envelope of a `.tar.md5` style file.
    ///
    /// The digest covers every byte preceding the appended hash line;
    /// comparison is case-insensitive. Absence of the envelope is not an
    /// error.
    fn verify_md5_envelope(&self, path: &Path) -> Result<(), PackageError> {
        let len = std::fs::metadata(path)?.len();
        let tail_len = len.min(512);
        let mut tail = vec![0u8; tail_len as usize];
        {
            let mut f = File::open(path)?;
            f.seek(SeekFrom::Start(len - tail_len))?;
            f.read_exact(&mut tail)?;
        }

        let Some((expected, line_start)) = find_envelope_line(&tail) else {
            debug!(path = %path.display(), "no MD5 envelope present");
            return Ok(());
        };

        let payload_len = len - tail_len + line_start as u64;
        let actual = hash::md5_hex(File::open(path)?, payload_len)?;
        if !actual.eq_ignore_ascii_case(&expected) {
            return Err(PackageError::IntegrityMismatch {
                path: path.to_path_buf(),
                expected,
                actual,
            });
        }
        info!(path = %path.display(), md5 = %actual, "MD5 envelope verified");
        Ok(())
    }

    fn verify_sha256(&self, path: &Path) -> Result<(), PackageError> {
        let len = std::fs::metadata(path)?.len();
        let actual = hash::sha256_hex(File::open(path)?, len)?;
        match &self.expected_sha256 {
            Some(expected) if !actual.eq_ignore_ascii_case(expected) => {
                Err(PackageError::IntegrityMismatch {
                    path: path.to_path_buf(),
                    expected: expected.clone(),
                    actual,
                })
            }
            Some(_) => {
                info!(path = %path.display(), sha256 = %actual, "SHA-256 verified");
                Ok(())
            }
            None => {
                info!(path = %path.display(), sha256 = %actual, "SHA-256 (no expected value supplied)");
                Ok(())
            }
        }
    }
}

/// Map a payload filename to its target partition, by lowercase
/// substring match in priority order; unmatched names fall back to the
/// filename stem before the last `.`.
pub fn derive_partition_name(filename: &str) -> String {
    let base = filename.rsplit('/').next().unwrap_or(filename);
    let lower = base.to_ascii_lowercase();

    for (needle, partition) in [
        (".pit", "PIT"),
        ("boot", "BOOT"),
        ("recovery", "RECOVERY"),
        ("system", "SYSTEM"),
        ("modem", "MODEM"),
        ("cp_", "MODEM"),
        ("param", "PARAM"),
        ("efs", "EFS"),
        ("cache", "CACHE"),
        ("hidden", "HIDDEN"),
    ] {
        if lower.contains(needle) {
            return partition.to_string();
        }
    }

    match base.rfind('.') {
        Some(dot) => base[..dot].to_string(),
        None => base.to_string(),
    }
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Locate the appended hash line in a file tail: the run of bytes after
/// the last NUL or newline, starting with 32 hex digits.
fn find_envelope_line(tail: &[u8]) -> Option<(String, usize)> {
    let mut end = tail.len();
    while end > 0 && (tail[end - 1] == b'\n' || tail[end - 1] == b'\r') {
        end -= 1;
    }

    let start = tail[..end]
        .iter()
        .rposition(|&b| b == 0 || b == b'\n')
        .map(|p| p + 1)
        .unwrap_or(0);

    let line = &tail[start..end];
    if line.len() < 32 || !line[..32].iter().all(u8::is_ascii_hexdigit) {
        return None;
    }

    let hex = std::str::from_utf8(&line[..32]).ok()?.to_ascii_lowercase();
    Some((hex, start))
}
