//! P-256 ECDH key agreement, used for the E2E channel's ephemeral
//! handshake and nothing else — a classical key exchange, not a
//! post-quantum hybrid.

use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::{EncodePublicKey, LineEnding};
use p256::{PublicKey as P256PublicKey, SecretKey as P256SecretKey};
use rand_core::OsRng;
use zeroize::Zeroizing;

use crate::error::EncodingError;

/// The enclave's static long-term ECDH key pair, generated once at boot.
pub struct KeyPair {
    secret: P256SecretKey,
    public: P256PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = P256SecretKey::random(&mut OsRng);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// SEC1 compressed point encoding (33 bytes for P-256), used only for
    /// the ECDH agreement itself.
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public.to_encoded_point(true).as_bytes().to_vec()
    }

    /// SPKI PEM encoding, the representation published to clients and bound
    /// into the attestation report's `report_data`.
    pub fn public_key_pem(&self) -> Result<String, EncodingError> {
        self.public.to_public_key_pem(LineEnding::LF).map_err(|_| EncodingError)
    }

    /// Agree with a peer's ephemeral public key, producing the raw ECDH
    /// shared secret. Callers must run the result through HKDF before use
    /// as key material — this is not itself a symmetric key.
    pub fn agree(&self, peer_public_key: &[u8]) -> Result<Zeroizing<[u8; 32]>, EncodingError> {
        let peer = P256PublicKey::from_sec1_bytes(peer_public_key).map_err(|_| EncodingError)?;
        let shared = p256::ecdh::diffie_hellman(&self.secret.to_nonzero_scalar(), peer.as_affine());
        let mut out = [0u8; 32];
        out.copy_from_slice(shared.raw_secret_bytes().as_slice());
        Ok(Zeroizing::new(out))
    }
}

/// A one-shot ephemeral key pair. The real client side of this exchange
/// lives outside this crate (any HTTPS client can generate one); this type
/// exists so the crate's own test suite can play that role.
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: P256PublicKey,
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public = secret.public_key();
        Self { secret, public }
    }

    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public.to_encoded_point(true).as_bytes().to_vec()
    }

    pub fn agree(&self, peer_public_key: &[u8]) -> Result<Zeroizing<[u8; 32]>, EncodingError> {
        let peer = P256PublicKey::from_sec1_bytes(peer_public_key).map_err(|_| EncodingError)?;
        let shared = self.secret.diffie_hellman(&peer);
        let mut out = [0u8; 32];
        out.copy_from_slice(shared.raw_secret_bytes().as_slice());
        Ok(Zeroizing::new(out))
    }
}
