//! AAD and HKDF-info builders for domain separation.
//!
//! Most ciphertexts in this system get their domain separation from key
//! separation (master key vs. DEK vs. E2E channel key) rather than from
//! AAD — DEK wraps use empty AAD. Where a
//! ciphertext's AAD does carry information — binding a credential field's
//! ciphertext to the record and field it belongs to, so one field's
//! ciphertext can't be swapped into another's slot — these builders give
//! that binding one canonical, unambiguous encoding (length-prefixed, so
//! `("ab", "c")` and `("a", "bc")` can never collide).

/// Canonical empty AAD, named for call-site clarity over a bare `&[]`.
pub fn empty() -> Vec<u8> {
    Vec::new()
}

fn encode_parts(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for part in parts {
        out.extend_from_slice(&(part.len() as u32).to_be_bytes());
        out.extend_from_slice(part);
    }
    out
}

/// Bind a credential field's ciphertext to its owning connection and field.
pub fn for_credential_field(connection_id: &str, field: &str) -> Vec<u8> {
    encode_parts(&[b"credential-field", connection_id.as_bytes(), field.as_bytes()])
}

/// Bind a snapshot ciphertext to the user and day it covers.
pub fn for_snapshot(user_id: &str, snapshot_date: &str) -> Vec<u8> {
    encode_parts(&[b"snapshot", user_id.as_bytes(), snapshot_date.as_bytes()])
}

/// HKDF info string for the E2E channel's key derivation. Not an AEAD AAD —
/// it's HKDF's third argument — but it plays the same domain-separation
/// role as the builders above, so it lives alongside them.
pub const E2E_HKDF_INFO: &[u8] = b"enclave-e2e-encryption";

/// HKDF info string for deriving the master key from the attested
/// measurement.
pub const MASTER_KEY_HKDF_INFO: &[u8] = b"track-record-enclave-dek";
