//! Envelope wire format for the E2E ECIES channel.
//!
//! The envelope is a four-tuple: an ephemeral P-256 public key, a 12-byte
//! IV, the AES-256-GCM ciphertext, and its 16-byte tag. It travels as JSON
//! (base64-encoded fields) inside the admission endpoint's request body —
//! there is no packed binary wire blob, since this envelope is produced by
//! an ordinary HTTPS JSON client rather than another instance of this
//! crate.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::{DecryptionError, EncodingError};

pub const IV_BYTES: usize = 12;
pub const TAG_BYTES: usize = 16;

/// ECIES envelope as received from a client, fields base64-encoded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub ephemeral_public_key: String,
    pub iv: String,
    pub ciphertext: String,
    pub auth_tag: String,
}

/// Decoded envelope, ready for decryption.
pub struct EnvelopeBytes {
    pub ephemeral_public_key: Vec<u8>,
    pub iv: [u8; IV_BYTES],
    pub ciphertext_and_tag: Vec<u8>,
}

impl Envelope {
    /// Decode base64 fields into raw bytes. Any malformed field — bad
    /// base64, wrong IV length, wrong tag length — collapses to the same
    /// opaque `DecryptionError`, with no distinguishing errors.
    pub fn decode(&self) -> Result<EnvelopeBytes, DecryptionError> {
        let ephemeral_public_key = STANDARD
            .decode(&self.ephemeral_public_key)
            .map_err(|_| DecryptionError)?;

        let iv_raw = STANDARD.decode(&self.iv).map_err(|_| DecryptionError)?;
        let iv: [u8; IV_BYTES] = iv_raw.as_slice().try_into().map_err(|_| DecryptionError)?;

        let ciphertext = STANDARD
            .decode(&self.ciphertext)
            .map_err(|_| DecryptionError)?;
        let tag = STANDARD
            .decode(&self.auth_tag)
            .map_err(|_| DecryptionError)?;
        if tag.len() != TAG_BYTES {
            return Err(DecryptionError);
        }

        let mut ciphertext_and_tag = ciphertext;
        ciphertext_and_tag.extend_from_slice(&tag);
        Ok(EnvelopeBytes {
            ephemeral_public_key,
            iv,
            ciphertext_and_tag,
        })
    }

    /// Build an envelope from raw parts. Used by the encrypting side of
    /// tests and by anything constructing envelopes in-process.
    pub fn encode(
        ephemeral_public_key: &[u8],
        iv: &[u8; IV_BYTES],
        ciphertext_and_tag: &[u8],
    ) -> Result<Self, EncodingError> {
        if ciphertext_and_tag.len() < TAG_BYTES {
            return Err(EncodingError);
        }
        let split = ciphertext_and_tag.len() - TAG_BYTES;
        Ok(Self {
            ephemeral_public_key: STANDARD.encode(ephemeral_public_key),
            iv: STANDARD.encode(iv),
            ciphertext: STANDARD.encode(&ciphertext_and_tag[..split]),
            auth_tag: STANDARD.encode(&ciphertext_and_tag[split..]),
        })
    }
}
