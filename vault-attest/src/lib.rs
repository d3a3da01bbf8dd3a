//! Hardware attestation acquisition and in-enclave TLS identity for the
//! confidential credential vault.
//!
//! This crate owns the two process-lifetime identities that anchor trust
//! in the enclave: the [`attestation`] module produces signed hardware
//! reports binding caller-chosen data, and [`tls_identity`] generates and
//! memoizes the self-signed certificate clients see over TLS.

#![deny(unsafe_code)]

pub mod attestation;
pub mod error;
pub mod tls_identity;

pub use attestation::{AttestationProvider, AttestationReport};
pub use error::{AttestationError, TlsIdentityError};
pub use tls_identity::{TlsCredentials, TlsIdentity};
