//! Hashing and checksums

use sha1::{Digest, Sha1};

use crate::types::{Hash, HASH_SIZE};

/// Compute the 160-bit hash of data
pub fn hash(data: &[u8]) -> Hash {
    let digest = Sha1::digest(data);
    let mut result = [0u8; HASH_SIZE];
    result.copy_from_slice(&digest);
    result
}

/// Verify that data matches expected hash
pub fn verify(expected: &Hash, data: &[u8]) -> bool {
    hash(data) == *expected
}

/// CRC32 of a byte slice
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// CRC32 over a sequence of child checksums, each taken big-endian
pub fn crc32_chain(crcs: &[u32]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for crc in crcs {
        hasher.update(&crc.to_be_bytes());
    }
    hasher.finalize()
}
