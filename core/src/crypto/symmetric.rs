//! Symmetric primitives
//!
//! - [`derive_key`]: HKDF-SHA256 extract-and-expand with no salt and no info,
//!   producing a 16-byte key. Used for root, chain and passphrase keys.
//! - [`encrypt_and_hash`] / [`decrypt_hashed_data`]: AES-GCM under a key
//!   derived from the passphrase, with the SHA-256 of the plaintext stored
//!   in front of the nonce. Both the GCM tag and the hash must check out.
//!
//! Blob layout: `sha256(plaintext) [32] || nonce [12] || ciphertext+tag`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::crypto::errors::{CryptoError, CryptoResult};

/// Length of every derived symmetric key
pub const KEY_LEN: usize = 16;

/// Length of the plaintext hash prefix
pub const HASH_LEN: usize = 32;

/// Length of the AES-GCM nonce
pub const NONCE_LEN: usize = 12;

const TAG_LEN: usize = 16;

/// A 16-byte key produced by [`derive_key`]
pub type SymmetricKey = [u8; KEY_LEN];

/// Derive a 16-byte key from arbitrary key material
///
/// Deterministic: the same material always yields the same key.
pub fn derive_key(material: &[u8]) -> CryptoResult<SymmetricKey> {
    let hkdf = Hkdf::<Sha256>::new(None, material);
    let mut output = [0u8; KEY_LEN];
    hkdf.expand(&[], &mut output)
        .map_err(|e| CryptoError::InternalError(format!("HKDF expansion failed: {}", e)))?;
    Ok(output)
}

/// Fill `buf` from the operating system CSPRNG
///
/// # Panics
///
/// Panics when the entropy source is unavailable.
pub fn fill_random(buf: &mut [u8]) {
    if let Err(e) = OsRng.try_fill_bytes(buf) {
        tracing::error!("Secure randomness source unavailable: {}", e);
        panic!("secure randomness source unavailable: {e}");
    }
}

/// Generate `n` cryptographically secure random bytes
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    fill_random(&mut buf);
    buf
}

/// Encrypt `plaintext` under a key derived from `passphrase`
pub fn encrypt_and_hash(plaintext: &[u8], passphrase: &[u8]) -> CryptoResult<Vec<u8>> {
    let key = Zeroizing::new(derive_key(passphrase)?);
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key.as_ref()));

    let mut nonce = [0u8; NONCE_LEN];
    fill_random(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::InternalError("AES-GCM encryption failed".to_string()))?;

    let hash = Sha256::digest(plaintext);

    let mut blob = Vec::with_capacity(HASH_LEN + NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&hash);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Decrypt a blob produced by [`encrypt_and_hash`]
///
/// Wrong passphrase, truncation, tag failure and hash mismatch all return
/// the same [`CryptoError::DecryptionFailure`].
pub fn decrypt_hashed_data(blob: &[u8], passphrase: &[u8]) -> CryptoResult<Vec<u8>> {
    if blob.len() < HASH_LEN + NONCE_LEN + TAG_LEN {
        return Err(CryptoError::DecryptionFailure);
    }

    let (hash, rest) = blob.split_at(HASH_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let key = Zeroizing::new(derive_key(passphrase)?);
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key.as_ref()));
    let plaintext = cipher.decrypt(Nonce::from_slice(nonce), ciphertext)?;

    if Sha256::digest(&plaintext).as_slice() != hash {
        return Err(CryptoError::DecryptionFailure);
    }

    Ok(plaintext)
}
