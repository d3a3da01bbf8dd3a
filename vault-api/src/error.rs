//! Error kinds for bootstrap orchestration and the scheduler. Both follow
//! the same manual `Display`/`std::error::Error` convention as
//! `vault-keystore::error` rather than exceptions.

use std::fmt;

/// Failure during the ordered startup sequence. Every
/// variant is a well-typed value; `main` decides whether a given failure
/// aborts the process, which in production it always does except where
/// an explicit bypass is configured.
#[derive(Debug)]
pub enum BootstrapError {
    TlsIdentity(String),
    E2eIdentity(String),
    /// Attestation could not be verified and no bypass was configured.
    AttestationUnverified(String),
    Database(String),
    KeyHierarchy(String),
}

impl fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TlsIdentity(msg) => write!(f, "TLS identity generation failed: {msg}"),
            Self::E2eIdentity(msg) => write!(f, "E2E identity generation failed: {msg}"),
            Self::AttestationUnverified(msg) => write!(f, "attestation unverified: {msg}"),
            Self::Database(msg) => write!(f, "database connection failed: {msg}"),
            Self::KeyHierarchy(msg) => write!(f, "key hierarchy initialization failed: {msg}"),
        }
    }
}

impl std::error::Error for BootstrapError {}

/// Failure within one scheduler tick, distinct from a single connector's
/// `ConnectorError` (which drives the per-user atomic abort but never
/// stops the tick itself).
#[derive(Debug)]
pub enum SchedulerError {
    Vault(String),
    Database(String),
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vault(msg) => write!(f, "vault error during scheduler tick: {msg}"),
            Self::Database(msg) => write!(f, "database error during scheduler tick: {msg}"),
        }
    }
}

impl std::error::Error for SchedulerError {}

impl From<vault_keystore::VaultError> for SchedulerError {
    fn from(e: vault_keystore::VaultError) -> Self {
        Self::Vault(e.to_string())
    }
}
