//! Persistent record shapes: data-encryption keys and credential
//! connections. Both are rows in the relational store (§6); neither ever
//! carries plaintext secret material.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier for a derived master key: the leading 8 bytes of
/// `SHA-256(master_key)`, hex-encoded.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MasterKeyId(String);

impl MasterKeyId {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MasterKeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One field's ciphertext: a fresh IV, the AEAD ciphertext, and its tag,
/// each base64-encoded. Persisted as a single `.`-joined compact string so
/// one sqlite TEXT column holds the whole triple.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedField {
    pub iv: String,
    pub ciphertext: String,
    pub auth_tag: String,
}

impl EncryptedField {
    pub fn to_compact(&self) -> String {
        format!("{}.{}.{}", self.iv, self.ciphertext, self.auth_tag)
    }

    pub fn from_compact(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, '.');
        Some(Self {
            iv: parts.next()?.to_string(),
            ciphertext: parts.next()?.to_string(),
            auth_tag: parts.next()?.to_string(),
        })
    }
}

/// A data-encryption key (DEK) record. Invariant: at most one row per
/// database has `is_active = true`.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct DekRecord {
    pub id: i64,
    pub wrapped_dek: String,
    pub iv: String,
    pub auth_tag: String,
    pub key_version: i64,
    pub master_key_id: String,
    pub is_active: bool,
    pub rotated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A credential connection record. Each `encrypted_*` field is an
/// independent ciphertext under the active DEK, compact-encoded via
/// [`EncryptedField::to_compact`].
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct CredentialRecord {
    pub id: i64,
    pub user_uid: String,
    pub exchange: String,
    pub label: String,
    pub encrypted_api_key: String,
    pub encrypted_api_secret: String,
    pub encrypted_passphrase: Option<String>,
    pub credentials_hash: String,
    pub sync_interval_minutes: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Non-secret metadata returned by `list_by_user` — never carries
/// ciphertext or the credentials hash's preimage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CredentialMetadata {
    pub id: i64,
    pub user_uid: String,
    pub exchange: String,
    pub label: String,
    pub sync_interval_minutes: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&CredentialRecord> for CredentialMetadata {
    fn from(r: &CredentialRecord) -> Self {
        Self {
            id: r.id,
            user_uid: r.user_uid.clone(),
            exchange: r.exchange.clone(),
            label: r.label.clone(),
            sync_interval_minutes: r.sync_interval_minutes,
            is_active: r.is_active,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

/// The decrypted fields of a credential, handed to the caller's closure by
/// `with_decrypted` and wiped on every exit path.
#[derive(Clone)]
pub struct DecryptedCredential {
    pub api_key: zeroize::Zeroizing<String>,
    pub api_secret: zeroize::Zeroizing<String>,
    pub passphrase: Option<zeroize::Zeroizing<String>>,
}

impl Drop for DecryptedCredential {
    fn drop(&mut self) {
        self.api_key.zeroize();
        self.api_secret.zeroize();
        if let Some(p) = self.passphrase.as_mut() {
            p.zeroize();
        }
    }
}

use zeroize::Zeroize;

/// Plaintext credential fields submitted to `create`/`update`. Never
/// persisted as-is — each field is encrypted independently before the
/// insert, and the struct is zeroized on drop like `DecryptedCredential`.
#[derive(Clone)]
pub struct NewCredential {
    pub user_uid: String,
    pub exchange: String,
    pub label: String,
    pub api_key: zeroize::Zeroizing<String>,
    pub api_secret: zeroize::Zeroizing<String>,
    pub passphrase: Option<zeroize::Zeroizing<String>>,
    pub sync_interval_minutes: i64,
}

impl Drop for NewCredential {
    fn drop(&mut self) {
        self.api_key.zeroize();
        self.api_secret.zeroize();
        if let Some(p) = self.passphrase.as_mut() {
            p.zeroize();
        }
    }
}

/// A per-market equity breakdown entry within a snapshot. Persisted as a
/// JSON array in `snapshot_data.breakdown_by_market`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarketBreakdown {
    pub market: String,
    pub equity: f64,
}

/// One connector's built snapshot for a single `(user_uid, exchange,
/// label)` at the scheduler's fixed tick timestamp. Built in memory by the
/// scheduler (§4.H) and persisted only as part of a user's all-or-nothing
/// atomic batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewSnapshot {
    pub user_uid: String,
    pub exchange: String,
    pub label: String,
    pub timestamp: DateTime<Utc>,
    pub total_equity: f64,
    pub realized_balance: f64,
    pub unrealized_pnl: f64,
    pub deposits: f64,
    pub withdrawals: f64,
    pub breakdown_by_market: Vec<MarketBreakdown>,
}

/// A persisted snapshot row. Uniqueness: `(user_uid, timestamp, exchange,
/// label)`.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct SnapshotRecord {
    pub id: i64,
    pub user_uid: String,
    pub exchange: String,
    pub label: String,
    pub timestamp: DateTime<Utc>,
    pub total_equity: f64,
    pub realized_balance: f64,
    pub unrealized_pnl: f64,
    pub deposits: f64,
    pub withdrawals: f64,
    /// JSON-encoded `Vec<MarketBreakdown>`.
    pub breakdown_by_market: String,
}

/// One row per completed or skipped scheduler tick, kept for the
/// observables the scheduler tracks (duration, snapshots saved, users
/// aborted, next scheduled time).
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct SyncStatusRecord {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub snapshots_saved: i64,
    pub users_aborted: i64,
    pub skipped_overlap: bool,
    pub triggered_by: String,
}
