//! Error kinds for the key hierarchy and credential vault.
//!
//! Each kind is distinct at the type level. `VaultError` is
//! the vault-facing surface; the admission endpoint (`vault-api`) maps it
//! onto HTTP responses, collapsing [`VaultError::Crypto`] into the single
//! opaque *decryption failed* message regardless of which crypto step
//! failed underneath.

use std::fmt;

/// Failure acquiring or using the active data-encryption key.
#[derive(Debug)]
pub enum HierarchyError {
    /// No active DEK exists yet and none was requested to be created.
    NotInitialized,
    /// The active DEK's `master_key_id` does not match the currently
    /// derived master key. Resolved only by an explicit
    /// `migrate_to_new_master` call — never silently.
    MasterKeyMismatch { recorded: String, current: String },
    /// Wrap/unwrap AEAD failure — tampered ciphertext, wrong master key.
    CryptoFailure,
    /// The database is unreachable or returned a retryable transient
    /// error (connection reset, pool-acquire timeout, etc).
    TransientDatabase(String),
    /// The database returned a non-retryable error.
    FatalDatabase(String),
}

impl fmt::Display for HierarchyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "key hierarchy not initialized"),
            Self::MasterKeyMismatch { recorded, current } => write!(
                f,
                "active DEK wrapped under master {recorded}, current master is {current}: migration required"
            ),
            Self::CryptoFailure => write!(f, "key wrap/unwrap failed"),
            Self::TransientDatabase(msg) => write!(f, "transient database error: {msg}"),
            Self::FatalDatabase(msg) => write!(f, "database error: {msg}"),
        }
    }
}

impl std::error::Error for HierarchyError {}

/// Failure from the credential vault's CRUD and scoped-access surface.
#[derive(Debug)]
pub enum VaultError {
    /// Uniqueness violation on `(user_uid, exchange, label)`. Returned
    /// verbatim to the client.
    DuplicateConnection,
    /// The record doesn't exist or was already deleted/deactivated.
    NotFound,
    /// Any crypto failure — AEAD tag mismatch, key hierarchy failure,
    /// malformed ciphertext. Collapsed to one opaque client-facing kind
    /// to avoid decryption oracles.
    Crypto,
    Transient(String),
    Fatal(String),
}

impl fmt::Display for VaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateConnection => write!(f, "already connected"),
            Self::NotFound => write!(f, "connection not found"),
            Self::Crypto => write!(f, "decryption failed"),
            Self::Transient(msg) => write!(f, "transient database error: {msg}"),
            Self::Fatal(msg) => write!(f, "database error: {msg}"),
        }
    }
}

impl std::error::Error for VaultError {}

impl From<HierarchyError> for VaultError {
    fn from(e: HierarchyError) -> Self {
        match e {
            HierarchyError::NotInitialized
            | HierarchyError::MasterKeyMismatch { .. }
            | HierarchyError::CryptoFailure => Self::Crypto,
            HierarchyError::TransientDatabase(msg) => Self::Transient(msg),
            HierarchyError::FatalDatabase(msg) => Self::Fatal(msg),
        }
    }
}

/// Classify a `sqlx::Error` into the retry-or-fatal split the hierarchy and
/// vault need: connection reset, pool-acquire timeout, and server-closed
/// connection are transient; everything else (including constraint
/// violations, which callers should already have mapped to
/// `DuplicateConnection` before reaching here) is fatal.
pub fn classify_sqlx_error(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
    )
}

pub fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}
