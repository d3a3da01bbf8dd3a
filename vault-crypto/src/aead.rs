//! AES-256-GCM authenticated encryption.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand_core::{OsRng, RngCore};

use crate::error::{DecryptionError, EncodingError};

pub const NONCE_BYTES: usize = 12;

/// A fresh random 96-bit nonce. Callers must never reuse a nonce under the
/// same key.
pub fn random_nonce() -> [u8; NONCE_BYTES] {
    let mut nonce = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn seal(
    key: &[u8; 32],
    nonce: &[u8; NONCE_BYTES],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, EncodingError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| EncodingError)
}

/// Decrypt ciphertext with its GCM tag appended to the end (the `aes-gcm`
/// crate's own output convention), returning the opaque `DecryptionError`
/// on any failure — bad key, wrong nonce, tampered ciphertext, or a tag
/// mismatch all look identical to the caller.
pub fn open(
    key: &[u8; 32],
    nonce: &[u8; NONCE_BYTES],
    ciphertext_and_tag: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, DecryptionError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext_and_tag, aad })
        .map_err(|_| DecryptionError)
}
