//! Content codec for fixed-size blocks
//!
//! Convergent encryption: the key is derived from the hash of the block's own
//! plaintext, so equal blocks always produce equal ciphertext.
//!
//! Algorithm:
//! 1. key_hash = H(plaintext[..len])
//! 2. (aes_key, iv) = HKDF-SHA256(key_hash, salt="chktree-chk", info="block-key-iv")
//! 3. ciphertext = AES-256-CTR(aes_key, iv, plaintext) over the full 1024-byte block
//!
//! The cipher is size-preserving so a ciphertext block is again exactly
//! `CONTENT_SIZE` bytes. There is no integrity check here: callers re-hash
//! the decrypted plaintext and compare against the key.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::types::{ContentBlock, Hash};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// HKDF salt for block key derivation
const CHK_SALT: &[u8] = b"chktree-chk";

/// HKDF info string
const KEY_IV_INFO: &[u8] = b"block-key-iv";

const KEY_SIZE: usize = 32;
const IV_SIZE: usize = 16;

/// Encryption error
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
}

/// Derive session key and IV from a key hash
fn derive_key_iv(key_hash: &Hash) -> Result<([u8; KEY_SIZE], [u8; IV_SIZE]), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(CHK_SALT), key_hash);

    let mut okm = [0u8; KEY_SIZE + IV_SIZE];
    hk.expand(KEY_IV_INFO, &mut okm)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;

    let mut key = [0u8; KEY_SIZE];
    let mut iv = [0u8; IV_SIZE];
    key.copy_from_slice(&okm[..KEY_SIZE]);
    iv.copy_from_slice(&okm[KEY_SIZE..]);
    Ok((key, iv))
}

fn apply(block: &ContentBlock, key_hash: &Hash) -> Result<ContentBlock, CryptoError> {
    let (key, iv) = derive_key_iv(key_hash)?;
    let mut cipher =
        Aes256Ctr::new_from_slices(&key, &iv).map_err(|_| CryptoError::InvalidKeyLength)?;

    let mut out = *block;
    cipher
        .try_apply_keystream(&mut out)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    Ok(out)
}

/// Encrypt one block under a key derived from `key_hash`
pub fn encrypt_block(plaintext: &ContentBlock, key_hash: &Hash) -> Result<ContentBlock, CryptoError> {
    apply(plaintext, key_hash)
}

/// Decrypt one block; the caller verifies the result against `key_hash`
pub fn decrypt_block(ciphertext: &ContentBlock, key_hash: &Hash) -> Result<ContentBlock, CryptoError> {
    apply(ciphertext, key_hash)
}
