//! Credential vault: CRUD over exchange API credentials,
//! each field an independent AES-256-GCM ciphertext under the hierarchy's
//! active DEK, with a scoped zeroizing accessor as the only path back to
//! plaintext.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::audit::{AuditAction, AuditEvent, AuditSinkSync};
use crate::error::{is_unique_violation, VaultError};
use crate::hierarchy::KeyHierarchy;
use crate::storage::Store;
use crate::types::{
    CredentialMetadata, CredentialRecord, DecryptedCredential, EncryptedField, NewCredential,
};
use vault_crypto::aad;
use vault_crypto::aead;

type HmacSha256 = Hmac<Sha256>;

pub struct CredentialVault {
    store: Store,
    hierarchy: KeyHierarchy,
    audit: Box<dyn AuditSinkSync>,
}

impl CredentialVault {
    pub fn new(store: Store, hierarchy: KeyHierarchy, audit: Box<dyn AuditSinkSync>) -> Self {
        Self { store, hierarchy, audit }
    }

    fn scope_key(user_uid: &str, exchange: &str, label: &str) -> String {
        format!("{user_uid}:{exchange}:{label}")
    }

    /// Deterministic, non-reversible fingerprint of the plaintext tuple,
    /// keyed by the active DEK — used only to detect a user re-submitting
    /// the same credentials under a new label.
    fn credentials_hash(
        dek: &[u8; 32],
        api_key: &str,
        api_secret: &str,
        passphrase: Option<&str>,
    ) -> Result<String, VaultError> {
        let mut mac = HmacSha256::new_from_slice(dek).map_err(|_| VaultError::Crypto)?;
        mac.update(api_key.as_bytes());
        mac.update(b"\0");
        mac.update(api_secret.as_bytes());
        mac.update(b"\0");
        mac.update(passphrase.unwrap_or("").as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn encrypt_field(
        dek: &[u8; 32],
        scope: &str,
        field: &str,
        plaintext: &str,
    ) -> Result<EncryptedField, VaultError> {
        let nonce = aead::random_nonce();
        let ciphertext_and_tag = aead::seal(
            dek,
            &nonce,
            plaintext.as_bytes(),
            &aad::for_credential_field(scope, field),
        )
        .map_err(|_| VaultError::Crypto)?;
        let split = ciphertext_and_tag.len() - vault_crypto::wire::TAG_BYTES;
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        Ok(EncryptedField {
            iv: STANDARD.encode(nonce),
            ciphertext: STANDARD.encode(&ciphertext_and_tag[..split]),
            auth_tag: STANDARD.encode(&ciphertext_and_tag[split..]),
        })
    }

    fn decrypt_field(
        dek: &[u8; 32],
        scope: &str,
        field: &str,
        compact: &str,
    ) -> Result<Zeroizing<String>, VaultError> {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let enc = EncryptedField::from_compact(compact).ok_or(VaultError::Crypto)?;
        let nonce_raw = STANDARD.decode(&enc.iv).map_err(|_| VaultError::Crypto)?;
        let nonce: [u8; aead::NONCE_BYTES] =
            nonce_raw.as_slice().try_into().map_err(|_| VaultError::Crypto)?;
        let ciphertext = STANDARD.decode(&enc.ciphertext).map_err(|_| VaultError::Crypto)?;
        let tag = STANDARD.decode(&enc.auth_tag).map_err(|_| VaultError::Crypto)?;

        let mut ciphertext_and_tag = ciphertext;
        ciphertext_and_tag.extend_from_slice(&tag);

        let plaintext = aead::open(
            dek,
            &nonce,
            &ciphertext_and_tag,
            &aad::for_credential_field(scope, field),
        )
        .map_err(|_| VaultError::Crypto)?;
        let s = String::from_utf8(plaintext).map_err(|_| VaultError::Crypto)?;
        Ok(Zeroizing::new(s))
    }

    /// Create a new credential connection. Rejects on `(user_uid,
    /// exchange, label)` collision with [`VaultError::DuplicateConnection`].
    /// If the same plaintext tuple is already stored under a different
    /// label for this user, the row is still created but an audit warning
    /// is recorded — never a silent merge.
    pub async fn create(&self, new: NewCredential) -> Result<CredentialMetadata, VaultError> {
        if self
            .store
            .find_by_unique(&new.user_uid, &new.exchange, &new.label)
            .await
            .map_err(map_store_err)?
            .is_some()
        {
            self.audit
                .record(AuditEvent::new(AuditAction::CredentialDuplicateRejected).with_failure());
            return Err(VaultError::DuplicateConnection);
        }

        let dek = self.hierarchy.get_current_dek().await?;
        let scope = Self::scope_key(&new.user_uid, &new.exchange, &new.label);

        let hash = Self::credentials_hash(
            &dek,
            &new.api_key,
            &new.api_secret,
            new.passphrase.as_ref().map(|p| p.as_str()),
        )?;

        if let Some(existing) = self
            .store
            .find_by_hash(&new.user_uid, &hash)
            .await
            .map_err(map_store_err)?
        {
            self.audit.record(AuditEvent::new(AuditAction::CredentialDeduplicationWarning {
                existing_connection_id: existing.id,
            }));
        }

        let enc_key = Self::encrypt_field(&dek, &scope, "api_key", &new.api_key)?;
        let enc_secret = Self::encrypt_field(&dek, &scope, "api_secret", &new.api_secret)?;
        let enc_passphrase = new
            .passphrase
            .as_ref()
            .map(|p| Self::encrypt_field(&dek, &scope, "passphrase", p.as_str()))
            .transpose()?;

        let record = self
            .store
            .insert_credential(
                &new,
                &enc_key.to_compact(),
                &enc_secret.to_compact(),
                enc_passphrase.as_ref().map(|f| f.to_compact()).as_deref(),
                &hash,
            )
            .await
            .map_err(map_store_err)?;

        self.audit.record(AuditEvent::new(AuditAction::CredentialCreated {
            connection_id: record.id,
        }));

        Ok(CredentialMetadata::from(&record))
    }

    /// Decrypt a credential's fields and hand them to `f` through a scoped
    /// accessor that is zeroized on every exit path, including panics that
    /// unwind through `f`.
    pub async fn with_decrypted<T>(
        &self,
        connection_id: i64,
        f: impl FnOnce(&DecryptedCredential) -> T,
    ) -> Result<T, VaultError> {
        let record = self
            .store
            .get_credential(connection_id)
            .await
            .map_err(map_store_err)?
            .ok_or(VaultError::NotFound)?;

        let decrypted = self.decrypt_record(&record).await;
        let decrypted = match decrypted {
            Ok(d) => d,
            Err(e) => {
                self.audit.record(
                    AuditEvent::new(AuditAction::CredentialDecryptionFailed { connection_id })
                        .with_failure(),
                );
                return Err(e);
            }
        };

        self.audit
            .record(AuditEvent::new(AuditAction::CredentialDecrypted { connection_id }));

        Ok(f(&decrypted))
    }

    async fn decrypt_record(&self, record: &CredentialRecord) -> Result<DecryptedCredential, VaultError> {
        let dek = self.hierarchy.get_current_dek().await?;
        let scope = Self::scope_key(&record.user_uid, &record.exchange, &record.label);

        let api_key = Self::decrypt_field(&dek, &scope, "api_key", &record.encrypted_api_key)?;
        let api_secret =
            Self::decrypt_field(&dek, &scope, "api_secret", &record.encrypted_api_secret)?;
        let passphrase = record
            .encrypted_passphrase
            .as_deref()
            .map(|c| Self::decrypt_field(&dek, &scope, "passphrase", c))
            .transpose()?;

        Ok(DecryptedCredential { api_key, api_secret, passphrase })
    }

    pub async fn list_by_user(
        &self,
        user_uid: &str,
        active_only: bool,
    ) -> Result<Vec<CredentialMetadata>, VaultError> {
        let rows = self
            .store
            .list_by_user(user_uid, active_only)
            .await
            .map_err(map_store_err)?;
        Ok(rows.iter().map(CredentialMetadata::from).collect())
    }

    /// Replace a connection's secret fields in place, re-encrypting under
    /// the current DEK. The row's identity (`user_uid`, `exchange`,
    /// `label`) never changes.
    pub async fn update(
        &self,
        connection_id: i64,
        api_key: &Zeroizing<String>,
        api_secret: &Zeroizing<String>,
        passphrase: Option<&Zeroizing<String>>,
        sync_interval_minutes: i64,
    ) -> Result<(), VaultError> {
        let record = self
            .store
            .get_credential(connection_id)
            .await
            .map_err(map_store_err)?
            .ok_or(VaultError::NotFound)?;

        let dek = self.hierarchy.get_current_dek().await?;
        let scope = Self::scope_key(&record.user_uid, &record.exchange, &record.label);

        let hash = Self::credentials_hash(&dek, api_key, api_secret, passphrase.map(|p| p.as_str()))?;
        let enc_key = Self::encrypt_field(&dek, &scope, "api_key", api_key)?;
        let enc_secret = Self::encrypt_field(&dek, &scope, "api_secret", api_secret)?;
        let enc_passphrase = passphrase
            .map(|p| Self::encrypt_field(&dek, &scope, "passphrase", p))
            .transpose()?;

        self.store
            .update_credential_fields(
                connection_id,
                &enc_key.to_compact(),
                &enc_secret.to_compact(),
                enc_passphrase.as_ref().map(|f| f.to_compact()).as_deref(),
                &hash,
                sync_interval_minutes,
            )
            .await
            .map_err(map_store_err)?;

        self.audit
            .record(AuditEvent::new(AuditAction::CredentialUpdated { connection_id }));
        Ok(())
    }

    pub async fn deactivate(&self, connection_id: i64) -> Result<(), VaultError> {
        self.store.deactivate_credential(connection_id).await.map_err(map_store_err)?;
        self.audit
            .record(AuditEvent::new(AuditAction::CredentialDeactivated { connection_id }));
        Ok(())
    }

    pub async fn delete(&self, connection_id: i64) -> Result<(), VaultError> {
        self.store.delete_credential(connection_id).await.map_err(map_store_err)?;
        self.audit
            .record(AuditEvent::new(AuditAction::CredentialDeleted { connection_id }));
        Ok(())
    }

    pub async fn count_active_for_user(&self, user_uid: &str) -> Result<i64, VaultError> {
        self.store.count_active_for_user(user_uid).await.map_err(map_store_err)
    }

    pub async fn count_active_total(&self) -> Result<i64, VaultError> {
        self.store.count_active_total().await.map_err(map_store_err)
    }
}

fn map_store_err(e: sqlx::Error) -> VaultError {
    if is_unique_violation(&e) {
        return VaultError::DuplicateConnection;
    }
    if crate::error::classify_sqlx_error(&e) {
        VaultError::Transient(e.to_string())
    } else {
        VaultError::Fatal(e.to_string())
    }
}
