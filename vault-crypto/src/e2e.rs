//! The E2E channel: a static P-256 key pair generated once at boot, used to
//! open ECIES envelopes sealed by clients against the enclave's published
//! public key.

use zeroize::Zeroizing;

use crate::aad;
use crate::aead;
use crate::ecdh::KeyPair;
use crate::error::{DecryptionError, EncodingError};
use crate::kdf::hkdf_sha256;
use crate::wire::Envelope;

/// The enclave's static ECDH identity for the E2E channel.
pub struct E2eIdentity {
    keys: KeyPair,
}

impl E2eIdentity {
    /// Generate a fresh key pair. Called once at boot; the result lives for
    /// the lifetime of the process.
    pub fn generate() -> Self {
        Self {
            keys: KeyPair::generate(),
        }
    }

    /// SEC1-compressed public key bytes, used for ECDH agreement only.
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.keys.public_key_bytes()
    }

    /// SPKI PEM encoding of the same public key, the representation
    /// published via the admission endpoint and bound into the
    /// attestation report's `report_data`.
    pub fn public_key_pem(&self) -> Result<String, EncodingError> {
        self.keys.public_key_pem()
    }

    /// Decrypt an ECIES envelope. Every failure — a malformed ephemeral
    /// point, an HKDF failure, a malformed envelope, or an AEAD tag
    /// mismatch — collapses to the same opaque `DecryptionError`.
    pub fn decrypt(&self, envelope: &Envelope) -> Result<Zeroizing<Vec<u8>>, DecryptionError> {
        let parts = envelope.decode()?;
        let shared_secret = self
            .keys
            .agree(&parts.ephemeral_public_key)
            .map_err(DecryptionError::from)?;
        let aes_key = hkdf_sha256(shared_secret.as_slice(), None, aad::E2E_HKDF_INFO)
            .map_err(DecryptionError::from)?;
        let plaintext = aead::open(&aes_key, &parts.iv, &parts.ciphertext_and_tag, &aad::empty())?;
        Ok(Zeroizing::new(plaintext))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::ecdh::EphemeralKeyPair;
    use crate::{aad, aead, kdf::hkdf_sha256, wire::Envelope};

    use super::E2eIdentity;

    fn seal(identity: &E2eIdentity, plaintext: &[u8]) -> Envelope {
        let ephemeral = EphemeralKeyPair::generate();
        let shared_secret = ephemeral.agree(&identity.public_key_bytes()).unwrap();
        let aes_key = hkdf_sha256(shared_secret.as_slice(), None, aad::E2E_HKDF_INFO).unwrap();
        let nonce = aead::random_nonce();
        let ciphertext = aead::seal(&aes_key, &nonce, plaintext, &aad::empty()).unwrap();
        Envelope::encode(&ephemeral.public_key_bytes(), &nonce, &ciphertext).unwrap()
    }

    proptest! {
        #[test]
        fn roundtrip_any_plaintext(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let identity = E2eIdentity::generate();
            let envelope = seal(&identity, &data);
            let plaintext = identity.decrypt(&envelope).unwrap();
            prop_assert_eq!(plaintext.as_slice(), data.as_slice());
        }

        #[test]
        fn single_bit_ciphertext_flip_always_rejected(
            data in proptest::collection::vec(any::<u8>(), 1..256),
            flip_index in 0usize..256,
        ) {
            let identity = E2eIdentity::generate();
            let mut envelope = seal(&identity, &data);
            let mut raw = base64::Engine::decode(
                &base64::engine::general_purpose::STANDARD,
                &envelope.ciphertext,
            ).unwrap();
            if !raw.is_empty() {
                let idx = flip_index % raw.len();
                raw[idx] ^= 0x01;
                envelope.ciphertext = base64::Engine::encode(
                    &base64::engine::general_purpose::STANDARD,
                    &raw,
                );
                prop_assert!(identity.decrypt(&envelope).is_err());
            }
        }
    }
}
