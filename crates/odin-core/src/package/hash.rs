//! Streaming digests with lowercase-hex serialization.
//!
//! Integrity envelopes are verified against digests of byte ranges, so
//! both functions hash exactly the first `len` bytes of the reader.

use md5::{Digest, Md5};
use sha2::Sha256;
use std::fmt::Write as _;
use std::io::{self, Read};

const CHUNK_SIZE: usize = 64 * 1024;

/// MD5 of the first `len` bytes, as lowercase hex.
pub fn md5_hex<R: Read>(reader: R, len: u64) -> io::Result<String> {
    digest_hex::<Md5, R>(reader, len)
}

/// SHA-256 of the first `len` bytes, as lowercase hex.
pub fn sha256_hex<R: Read>(reader: R, len: u64) -> io::Result<String> {
    digest_hex::<Sha256, R>(reader, len)
}

fn digest_hex<D: Digest, R: Read>(reader: R, len: u64) -> io::Result<String> {
    let mut hasher = D::new();
    let mut taken = reader.take(len);
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = taken.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_string(hasher.finalize().as_slice()))
}

fn hex_string(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        write!(out, "{b:02x}").unwrap();
    }
    out
}
