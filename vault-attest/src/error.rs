//! Error types for attestation acquisition and TLS identity generation.

use std::fmt;

/// Why an attestation report could not be produced or verified. Every
/// variant is a well-typed failure value; nothing in this crate panics on
/// expected failure conditions — the bootstrap sequence decides whether a
/// given variant is fatal (production) or loggable-and-continue
/// (development, with an explicit bypass flag).
#[derive(Debug)]
pub enum AttestationError {
    /// No guest device and no instance-metadata endpoint responded.
    HardwareUnavailable,
    /// The vendor guest tool could not be invoked or exited non-zero.
    ToolInvocation(String),
    /// The VCEK certificate or CA chain fetch failed.
    VcekFetch(String),
    /// The verifier rejected the report's signature chain.
    ChainVerification(String),
}

impl fmt::Display for AttestationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HardwareUnavailable => write!(f, "attestation hardware unavailable"),
            Self::ToolInvocation(msg) => write!(f, "guest tool invocation failed: {msg}"),
            Self::VcekFetch(msg) => write!(f, "VCEK fetch failed: {msg}"),
            Self::ChainVerification(msg) => write!(f, "chain verification failed: {msg}"),
        }
    }
}

impl std::error::Error for AttestationError {}

/// Why TLS identity generation failed. In practice this only fires on key
/// or certificate generation errors from the underlying crates — there is
/// no expected-failure path the way there is for attestation.
#[derive(Debug)]
pub struct TlsIdentityError(pub String);

impl fmt::Display for TlsIdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TLS identity generation failed: {}", self.0)
    }
}

impl std::error::Error for TlsIdentityError {}
