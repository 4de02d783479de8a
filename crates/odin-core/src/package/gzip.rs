//! Gzip extraction to a temporary file.
//!
//! A gzip-wrapped archive is streamed out to a temp file so the tar
//! reader can seek in it; the temp file is deleted when dropped.

use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::info;

/// Gzip stream magic.
pub const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// Whether the buffer starts with the gzip magic.
pub fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == GZIP_MAGIC[0] && data[1] == GZIP_MAGIC[1]
}

/// Inflate `path` into a named temporary file and return it.
pub fn inflate_to_temp(path: &Path) -> io::Result<NamedTempFile> {
    let mut decoder = GzDecoder::new(File::open(path)?);
    let mut temp = NamedTempFile::new()?;

    let written = io::copy(&mut decoder, temp.as_file_mut())?;
    temp.as_file_mut().flush()?;

    info!(
        src = %path.display(),
        dst = %temp.path().display(),
        bytes = written,
        "Extracted gzip stream"
    );
    Ok(temp)
}
