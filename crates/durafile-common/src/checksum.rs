//! Content checksums for stored files
//!
//! Every descriptor carries a checksum of its bytes. The finalizer records
//! the checksum of a staged artifact at prepare time and re-verifies it
//! before each commit attempt.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Checksum values computed for a file's bytes
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    /// CRC32C checksum (fast, for inline verification)
    pub crc32c: u32,
    /// xxHash64 (fast, for comparison)
    pub xxhash64: u64,
    /// SHA256 hash (optional, for content addressing)
    pub sha256: Option<[u8; 32]>,
}

impl Checksum {
    /// Compute checksum from data (with SHA256)
    #[must_use]
    pub fn compute_full(data: &[u8]) -> Self {
        let sha256_hash = Sha256::digest(data);
        Self {
            crc32c: crc32c::crc32c(data),
            xxhash64: xxhash_rust::xxh64::xxh64(data, 0),
            sha256: Some(sha256_hash.into()),
        }
    }

    /// Verify data against this checksum (fast check using CRC32C)
    #[must_use]
    pub fn verify_fast(&self, data: &[u8]) -> bool {
        crc32c::crc32c(data) == self.crc32c
    }

    /// Verify data against this checksum (full check)
    #[must_use]
    pub fn verify_full(&self, data: &[u8]) -> bool {
        if !self.verify_fast(data) {
            return false;
        }

        if xxhash_rust::xxh64::xxh64(data, 0) != self.xxhash64 {
            return false;
        }

        if let Some(expected_sha256) = &self.sha256 {
            let actual_sha256: [u8; 32] = Sha256::digest(data).into();
            if &actual_sha256 != expected_sha256 {
                return false;
            }
        }

        true
    }

    /// Short printable form, preferring the SHA256 when present
    #[must_use]
    pub fn to_hex(&self) -> String {
        match &self.sha256 {
            Some(sha) => hex::encode(sha),
            None => format!("{:08x}{:016x}", self.crc32c, self.xxhash64),
        }
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
