//! File content fingerprints.
//!
//! A fingerprint is the triple `(size, mtime, crc32)` used to decide content
//! equality without transferring bytes. Two files with equal fingerprints are
//! treated as identical; folders carry no fingerprint.

use std::io::{self, Read};

use serde::{Deserialize, Serialize};

/// Content fingerprint of a regular file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    /// File size in bytes.
    pub size: u64,
    /// Modification time, seconds since the Unix epoch.
    pub mtime: i64,
    /// CRC-32 of the full file content.
    pub crc: u32,
}

impl FileFingerprint {
    /// Computes a fingerprint by reading `reader` to the end.
    ///
    /// `size` and `mtime` come from the caller's stat of the same open
    /// handle so the three fields describe one consistent observation.
    pub fn from_reader<R: Read>(size: u64, mtime: i64, reader: &mut R) -> io::Result<Self> {
        let mut hasher = crc32fast::Hasher::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self {
            size,
            mtime,
            crc: hasher.finalize(),
        })
    }
}

/// Compares two optional fingerprints; `None` never equals anything.
pub fn fingerprints_equal(a: Option<&FileFingerprint>, b: Option<&FileFingerprint>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if a == b)
}
