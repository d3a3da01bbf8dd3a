//! Cryptographic primitives for the confidential credential vault's E2E
//! channel: ECDH P-256 key agreement, AES-256-GCM AEAD, HKDF-SHA-256, and
//! the JSON envelope wire format that carries them over the admission
//! endpoint.
//!
//! ## Security properties
//!
//! - **Uniform errors.** Every decryption failure path — bad ephemeral
//!   point, HKDF failure, tampered ciphertext, malformed envelope —
//!   produces the same [`DecryptionError`]. Nothing here leaks which step
//!   failed.
//! - **AAD binding.** Ciphertexts that need to be bound to their owning
//!   record use the [`aad`] builders; wrong binding causes decryption
//!   failure rather than silently accepting misplaced ciphertext.
//!
//! ## What's NOT provided
//!
//! Key storage, rotation, and credential persistence live in
//! `vault-keystore`; this crate only has the primitives.

#![deny(unsafe_code)]

pub mod aad;
pub mod aead;
pub mod e2e;
pub mod ecdh;
pub mod error;
pub mod kdf;
pub mod wire;

pub use e2e::E2eIdentity;
pub use error::{DecryptionError, EncodingError};
pub use wire::Envelope;
