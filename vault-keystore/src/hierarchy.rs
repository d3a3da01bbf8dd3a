//! Key hierarchy: derives the master key from the
//! attestation measurement, wraps/unwraps the single active
//! data-encryption key under it, and carries DEKs across a rotation of
//! the underlying hardware measurement via `migrate_to_new_master`.
//!
//! Three levels: attestation-derived master key
//! -> wrapped DEK -> per-credential AEAD records. The master key is never
//! persisted; it is re-derived on every process start from the
//! measurement handed in by the caller (`vault-api`'s bootstrap, which
//! owns the attestation report).

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::sync::RwLock;
use zeroize::Zeroizing;

use crate::audit::{AuditAction, AuditEvent, AuditSinkSync};
use crate::error::{is_unique_violation, HierarchyError};
use crate::storage::Store;
use crate::types::{DekRecord, MasterKeyId};
use vault_crypto::aad::MASTER_KEY_HKDF_INFO;
use vault_crypto::aead;
use vault_crypto::kdf::hkdf_sha256;

/// Seal a DEK under `key`, returning base64(IV), base64(ciphertext),
/// base64(tag) ready for the three separate `data_encryption_keys`
/// columns.
fn wrap_dek(key: &[u8; 32], dek: &[u8; 32]) -> Result<(String, String, String), HierarchyError> {
    let nonce = aead::random_nonce();
    let ciphertext_and_tag =
        aead::seal(key, &nonce, dek, &[]).map_err(|_| HierarchyError::CryptoFailure)?;
    let split = ciphertext_and_tag.len() - vault_crypto::wire::TAG_BYTES;
    Ok((
        STANDARD.encode(nonce),
        STANDARD.encode(&ciphertext_and_tag[..split]),
        STANDARD.encode(&ciphertext_and_tag[split..]),
    ))
}

/// Derive the master key from a SEV-SNP measurement and platform version,
/// and its identifier (leading 8 bytes of `SHA-256(master)`, hex).
///
/// `HKDF-SHA-256(ikm = measurement, salt = platform_version_or_empty,
/// info = "track-record-enclave-dek", L = 32)`.
pub fn derive_master_key(
    measurement: &[u8],
    platform_version: &str,
) -> Result<(MasterKeyId, Zeroizing<[u8; 32]>), HierarchyError> {
    let salt = if platform_version.is_empty() {
        None
    } else {
        Some(platform_version.as_bytes())
    };
    let master = Zeroizing::new(
        hkdf_sha256(measurement, salt, MASTER_KEY_HKDF_INFO)
            .map_err(|_| HierarchyError::CryptoFailure)?,
    );

    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(master.as_slice());
    let id = hex::encode(&digest[..8]);

    Ok((MasterKeyId::from_hex(id), master))
}

/// The single active DEK, cached behind a single-writer/multi-reader lock
/// so concurrent credential operations share one unwrap per process
/// lifetime instead of re-deriving on every call.
pub struct KeyHierarchy {
    store: Store,
    audit: Box<dyn AuditSinkSync>,
    master_key_id: MasterKeyId,
    master_key: Zeroizing<[u8; 32]>,
    cached_dek: RwLock<Option<Zeroizing<[u8; 32]>>>,
}

impl KeyHierarchy {
    pub fn new(
        store: Store,
        audit: Box<dyn AuditSinkSync>,
        measurement: &[u8],
        platform_version: &str,
    ) -> Result<Self, HierarchyError> {
        let (master_key_id, master_key) = derive_master_key(measurement, platform_version)?;
        audit.record(AuditEvent::new(AuditAction::MasterKeyDerived {
            master_key_id: master_key_id.as_str().to_string(),
        }));
        Ok(Self {
            store,
            audit,
            master_key_id,
            master_key,
            cached_dek: RwLock::new(None),
        })
    }

    pub fn master_key_id(&self) -> &MasterKeyId {
        &self.master_key_id
    }

    /// True when no DEK row exists yet — the process must mint one before
    /// any credential can be created.
    pub async fn needs_initialization(&self) -> Result<bool, HierarchyError> {
        let active = self.store.active_dek().await.map_err(map_db_err)?;
        Ok(active.is_none())
    }

    /// True when the active DEK exists but is wrapped under a different
    /// master key than the one derived this process start.
    pub async fn needs_migration(&self) -> Result<bool, HierarchyError> {
        let active = self.store.active_dek().await.map_err(map_db_err)?;
        match active {
            None => Ok(false),
            Some(record) => Ok(record.master_key_id != self.master_key_id.as_str()),
        }
    }

    /// Return the unwrapped DEK, lazily minting and persisting a fresh one
    /// if this is the first call against an empty database.
    pub async fn get_current_dek(&self) -> Result<Zeroizing<[u8; 32]>, HierarchyError> {
        {
            let cached = self.cached_dek.read().await;
            if let Some(dek) = cached.as_ref() {
                return Ok(Zeroizing::new(**dek));
            }
        }

        let mut guard = self.cached_dek.write().await;
        if let Some(dek) = guard.as_ref() {
            return Ok(Zeroizing::new(**dek));
        }

        let record = self.store.active_dek().await.map_err(map_db_err)?;
        let dek = match record {
            Some(record) => self.unwrap_record(&record)?,
            None => self.mint_initial_dek().await?,
        };

        *guard = Some(Zeroizing::new(*dek));
        Ok(dek)
    }

    async fn mint_initial_dek(&self) -> Result<Zeroizing<[u8; 32]>, HierarchyError> {
        let mut raw = [0u8; 32];
        use rand_core::RngCore;
        rand_core::OsRng.fill_bytes(&mut raw);
        let dek = Zeroizing::new(raw);

        let (iv, ciphertext, tag) = wrap_dek(&self.master_key, &dek)?;

        self.store
            .insert_initial_dek(&ciphertext, &iv, &tag, self.master_key_id.as_str())
            .await
            .map_err(map_db_err)?;

        self.audit.record(AuditEvent::new(AuditAction::DekGenerated {
            master_key_id: self.master_key_id.as_str().to_string(),
        }));

        Ok(dek)
    }

    fn unwrap_record(&self, record: &DekRecord) -> Result<Zeroizing<[u8; 32]>, HierarchyError> {
        if record.master_key_id != self.master_key_id.as_str() {
            return Err(HierarchyError::MasterKeyMismatch {
                recorded: record.master_key_id.clone(),
                current: self.master_key_id.as_str().to_string(),
            });
        }
        self.unwrap_with_key(record, &self.master_key)
    }

    fn unwrap_with_key(
        &self,
        record: &DekRecord,
        key: &[u8; 32],
    ) -> Result<Zeroizing<[u8; 32]>, HierarchyError> {
        let ciphertext = STANDARD
            .decode(&record.wrapped_dek)
            .map_err(|_| HierarchyError::CryptoFailure)?;
        let nonce_raw = STANDARD
            .decode(&record.iv)
            .map_err(|_| HierarchyError::CryptoFailure)?;
        let nonce: [u8; aead::NONCE_BYTES] = nonce_raw
            .as_slice()
            .try_into()
            .map_err(|_| HierarchyError::CryptoFailure)?;
        let tag = STANDARD
            .decode(&record.auth_tag)
            .map_err(|_| HierarchyError::CryptoFailure)?;

        let mut ciphertext_and_tag = ciphertext;
        ciphertext_and_tag.extend_from_slice(&tag);

        let plaintext = aead::open(key, &nonce, &ciphertext_and_tag, &[])
            .map_err(|_| HierarchyError::CryptoFailure)?;
        if plaintext.len() != 32 {
            return Err(HierarchyError::CryptoFailure);
        }
        let mut dek = [0u8; 32];
        dek.copy_from_slice(&plaintext);
        Ok(Zeroizing::new(dek))
    }

    /// Mint a fresh DEK, wrap it under the current master key, and make it
    /// the sole active row. Existing ciphertext under the prior DEK is
    /// left as-is — re-encrypting every credential is out of scope here.
    pub async fn rotate_dek(&self) -> Result<(), HierarchyError> {
        let mut raw = [0u8; 32];
        use rand_core::RngCore;
        rand_core::OsRng.fill_bytes(&mut raw);
        let dek = Zeroizing::new(raw);

        let (iv, ciphertext, tag) = wrap_dek(&self.master_key, &dek)?;

        self.store
            .rotate_dek(&ciphertext, &iv, &tag, self.master_key_id.as_str())
            .await
            .map_err(map_db_err)?;

        *self.cached_dek.write().await = Some(Zeroizing::new(*dek));

        self.audit.record(AuditEvent::new(AuditAction::DekRotated {
            master_key_id: self.master_key_id.as_str().to_string(),
        }));
        Ok(())
    }

    /// Re-wrap the active DEK under the master key derived from a new
    /// measurement, without touching the DEK's value or any ciphertext
    /// under it. `old_master` is the master key the active row is
    /// currently wrapped under (e.g. re-derived from a prior measurement
    /// kept around for the purpose, or supplied by an operator runbook).
    pub async fn migrate_to_new_master(
        &self,
        old_master: &[u8; 32],
    ) -> Result<(), HierarchyError> {
        let record = self
            .store
            .active_dek()
            .await
            .map_err(map_db_err)?
            .ok_or(HierarchyError::NotInitialized)?;

        if record.master_key_id == self.master_key_id.as_str() {
            return Ok(());
        }

        let dek = self.unwrap_with_key(&record, old_master)?;
        let (iv, ciphertext, tag) = wrap_dek(&self.master_key, &dek)?;

        self.store
            .rewrap_active_dek(&ciphertext, &iv, &tag, self.master_key_id.as_str())
            .await
            .map_err(map_db_err)?;

        *self.cached_dek.write().await = Some(Zeroizing::new(*dek));

        self.audit.record(AuditEvent::new(AuditAction::DekMigrated {
            from_master_key_id: record.master_key_id,
            to_master_key_id: self.master_key_id.as_str().to_string(),
        }));
        Ok(())
    }

    /// Evict the cached DEK, forcing the next `get_current_dek` call to
    /// re-unwrap from storage. Used by tests and by `rotate_dek`'s callers
    /// that want a clean re-read.
    pub async fn clear_cache(&self) {
        *self.cached_dek.write().await = None;
    }
}

fn map_db_err(e: sqlx::Error) -> HierarchyError {
    if is_unique_violation(&e) {
        return HierarchyError::FatalDatabase(e.to_string());
    }
    if crate::error::classify_sqlx_error(&e) {
        HierarchyError::TransientDatabase(e.to_string())
    } else {
        HierarchyError::FatalDatabase(e.to_string())
    }
}
