//! Round-trip and tamper-rejection tests for the E2E ECIES channel.
//!
//! These exercise the crate the way the admission endpoint will: a client
//! generates an ephemeral P-256 key pair, agrees with the enclave's
//! published public key, derives an AES key via HKDF, seals a message, and
//! builds an `Envelope`; the enclave's `E2eIdentity::decrypt` must recover
//! the plaintext and must reject any tampering with the same opaque error.

use vault_crypto::{aad, aead, ecdh::EphemeralKeyPair, kdf::hkdf_sha256, wire::Envelope, E2eIdentity};

/// Seal a plaintext to `identity`'s public key the way a client would,
/// returning the resulting envelope.
fn client_seal(identity: &E2eIdentity, plaintext: &[u8]) -> Envelope {
    let ephemeral = EphemeralKeyPair::generate();
    let shared_secret = ephemeral.agree(&identity.public_key_bytes()).unwrap();
    let aes_key = hkdf_sha256(shared_secret.as_slice(), None, aad::E2E_HKDF_INFO).unwrap();
    let nonce = aead::random_nonce();
    let ciphertext = aead::seal(&aes_key, &nonce, plaintext, &aad::empty()).unwrap();
    Envelope::encode(&ephemeral.public_key_bytes(), &nonce, &ciphertext).unwrap()
}

#[test]
fn roundtrip_basic() {
    let identity = E2eIdentity::generate();
    let envelope = client_seal(&identity, b"super secret api key");
    let plaintext = identity.decrypt(&envelope).unwrap();
    assert_eq!(plaintext.as_slice(), b"super secret api key");
}

#[test]
fn roundtrip_empty_plaintext() {
    let identity = E2eIdentity::generate();
    let envelope = client_seal(&identity, b"");
    let plaintext = identity.decrypt(&envelope).unwrap();
    assert_eq!(plaintext.as_slice(), b"");
}

#[test]
fn roundtrip_large_plaintext() {
    let identity = E2eIdentity::generate();
    let data = vec![0x5a_u8; 1 << 20];
    let envelope = client_seal(&identity, &data);
    let plaintext = identity.decrypt(&envelope).unwrap();
    assert_eq!(plaintext.as_slice(), data.as_slice());
}

#[test]
fn wrong_key_fails() {
    let identity = E2eIdentity::generate();
    let other = E2eIdentity::generate();
    let envelope = client_seal(&identity, b"secret");
    assert!(other.decrypt(&envelope).is_err());
}

#[test]
fn tamper_ciphertext_fails() {
    let identity = E2eIdentity::generate();
    let mut envelope = client_seal(&identity, b"secret");
    let mut raw = base64_decode(&envelope.ciphertext);
    raw[0] ^= 0x01;
    envelope.ciphertext = base64_encode(&raw);
    assert!(identity.decrypt(&envelope).is_err());
}

#[test]
fn tamper_auth_tag_fails() {
    let identity = E2eIdentity::generate();
    let mut envelope = client_seal(&identity, b"secret");
    let mut raw = base64_decode(&envelope.auth_tag);
    raw[0] ^= 0x01;
    envelope.auth_tag = base64_encode(&raw);
    assert!(identity.decrypt(&envelope).is_err());
}

#[test]
fn tamper_iv_fails() {
    let identity = E2eIdentity::generate();
    let mut envelope = client_seal(&identity, b"secret");
    let mut raw = base64_decode(&envelope.iv);
    raw[0] ^= 0x01;
    envelope.iv = base64_encode(&raw);
    assert!(identity.decrypt(&envelope).is_err());
}

#[test]
fn tamper_ephemeral_public_key_fails() {
    let identity = E2eIdentity::generate();
    let mut envelope = client_seal(&identity, b"secret");
    let mut raw = base64_decode(&envelope.ephemeral_public_key);
    raw[1] ^= 0x01;
    envelope.ephemeral_public_key = base64_encode(&raw);
    assert!(identity.decrypt(&envelope).is_err());
}

#[test]
fn malformed_base64_fails() {
    let identity = E2eIdentity::generate();
    let mut envelope = client_seal(&identity, b"secret");
    envelope.ciphertext = "not base64!!".to_string();
    assert!(identity.decrypt(&envelope).is_err());
}

#[test]
fn truncated_iv_fails() {
    let identity = E2eIdentity::generate();
    let mut envelope = client_seal(&identity, b"secret");
    envelope.iv = base64_encode(&[0u8; 4]);
    assert!(identity.decrypt(&envelope).is_err());
}

#[test]
fn truncated_auth_tag_fails() {
    let identity = E2eIdentity::generate();
    let mut envelope = client_seal(&identity, b"secret");
    envelope.auth_tag = base64_encode(&[0u8; 4]);
    assert!(identity.decrypt(&envelope).is_err());
}

#[test]
fn all_errors_are_uniform() {
    let identity = E2eIdentity::generate();
    let base = client_seal(&identity, b"secret");

    let mut wrong_key_env = base.clone();
    wrong_key_env.ephemeral_public_key = base64_encode(&[0x02; 33]);

    let mut bad_tag_env = base.clone();
    let mut raw = base64_decode(&bad_tag_env.auth_tag);
    raw[0] ^= 0xff;
    bad_tag_env.auth_tag = base64_encode(&raw);

    let err_a = identity.decrypt(&wrong_key_env).unwrap_err();
    let err_b = identity.decrypt(&bad_tag_env).unwrap_err();
    assert_eq!(err_a, err_b);
}

fn base64_decode(s: &str) -> Vec<u8> {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    STANDARD.decode(s).unwrap()
}

fn base64_encode(b: &[u8]) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    STANDARD.encode(b)
}
