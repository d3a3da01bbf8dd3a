//! HKDF-SHA-256 key derivation.
//!
//! Single generic derivation used by both the E2E channel (salt = empty,
//! fixed info string) and the key hierarchy's master-key derivation
//! (salt = platform_version, info = a fixed domain string). Keeping one
//! HKDF entry point avoids two subtly different derivation paths.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::EncodingError;

/// Derive a 32-byte key via HKDF-SHA-256(ikm, salt, info).
pub fn hkdf_sha256(ikm: &[u8], salt: Option<&[u8]>, info: &[u8]) -> Result<[u8; 32], EncodingError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut out = [0u8; 32];
    hk.expand(info, &mut out).map_err(|_| EncodingError)?;
    Ok(out)
}
