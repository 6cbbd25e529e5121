//! Core types for chktree
//!
//! Fixed sizes, hash codes and the file identifier produced by insertion.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of a hash code in bytes (160 bits)
pub const HASH_SIZE: usize = 20;

/// 160-bit hash code used for both keys and queries
pub type Hash = [u8; HASH_SIZE];

/// Size of every block on the wire and in the level files
pub const CONTENT_SIZE: usize = 1024;

/// Maximum number of children of an inner node
pub const CHK_PER_INODE: usize = 25;

/// One plaintext or ciphertext block
pub type ContentBlock = [u8; CONTENT_SIZE];

/// Convert hash to hex string
pub fn to_hex(hash: &Hash) -> String {
    hex::encode(hash)
}

/// Parse hex string to hash
pub fn from_hex(s: &str) -> Result<Hash, hex::FromHexError> {
    let bytes = hex::decode(s)?;
    if bytes.len() != HASH_SIZE {
        return Err(hex::FromHexError::InvalidStringLength);
    }
    let mut hash = [0u8; HASH_SIZE];
    hash.copy_from_slice(&bytes);
    Ok(hash)
}

/// A zero-filled block
pub fn empty_block() -> Box<ContentBlock> {
    Box::new([0u8; CONTENT_SIZE])
}

/// Key and query of one block
///
/// `key` is the hash of the plaintext and decrypts the block, `query` is the
/// hash of the ciphertext and is what the network sees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChkHashes {
    pub key: Hash,
    pub query: Hash,
}

impl ChkHashes {
    /// Serialized size: key followed by query
    pub const SIZE: usize = 2 * HASH_SIZE;

    pub fn new(key: Hash, query: Hash) -> Self {
        Self { key, query }
    }

    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.key);
        buf.put_slice(&self.query);
    }

    /// Read a pair; the caller checks that enough bytes remain
    pub fn read_from(buf: &mut impl Buf) -> Self {
        let mut key = [0u8; HASH_SIZE];
        let mut query = [0u8; HASH_SIZE];
        buf.copy_to_slice(&mut key);
        buf.copy_to_slice(&mut query);
        Self { key, query }
    }
}

/// Handle for a stored file: everything needed to download or delete it again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIdentifier {
    /// Key and query of the root block
    pub chk: ChkHashes,
    /// CRC32 over the root block's plaintext
    pub crc: u32,
    /// Length of the file in bytes
    pub file_length: u64,
}

impl FileIdentifier {
    /// Serialized size: length, crc, key, query
    pub const SIZE: usize = 8 + 4 + ChkHashes::SIZE;

    pub fn new(chk: ChkHashes, crc: u32, file_length: u64) -> Self {
        Self {
            chk,
            crc,
            file_length,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.put_u64(self.file_length);
        buf.put_u32(self.crc);
        self.chk.write_to(&mut buf);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::SIZE {
            return None;
        }
        let mut buf = bytes;
        let file_length = buf.get_u64();
        let crc = buf.get_u32();
        let chk = ChkHashes::read_from(&mut buf);
        Some(Self {
            chk,
            crc,
            file_length,
        })
    }
}

impl fmt::Display for FileIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{:08x}.{}",
            to_hex(&self.chk.key),
            to_hex(&self.chk.query),
            self.crc,
            self.file_length
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let hash = [0xabu8; HASH_SIZE];
        let hex = to_hex(&hash);
        assert_eq!(hex.len(), 40);
        assert_eq!(from_hex(&hex).unwrap(), hash);
    }

    #[test]
    fn test_from_hex_wrong_length() {
        assert!(from_hex("abcd").is_err());
    }

    #[test]
    fn test_file_identifier_bytes() {
        let fid = FileIdentifier::new(ChkHashes::new([1u8; 20], [2u8; 20]), 0xdeadbeef, 2000);
        let bytes = fid.to_bytes();
        assert_eq!(bytes.len(), FileIdentifier::SIZE);
        assert_eq!(&bytes[..8], &2000u64.to_be_bytes());
        assert_eq!(FileIdentifier::from_bytes(&bytes), Some(fid));
        assert_eq!(FileIdentifier::from_bytes(&bytes[1..]), None);
    }

    #[test]
    fn test_file_identifier_display() {
        let fid = FileIdentifier::new(ChkHashes::default(), 1, 5);
        let s = fid.to_string();
        assert!(s.ends_with(".00000001.5"));
    }
}
