//! # Vault Keystore
//!
//! The key hierarchy and credential vault for the confidential credential
//! store: derives the master key from the attested measurement, wraps a
//! single active data-encryption key under it, and stores exchange
//! credentials as independent per-field AEAD ciphertexts under that DEK.
//!
//! Three levels — attestation-derived master key, wrapped DEK, per-field
//! ciphertext — rather than a general-purpose multi-tenant key tree: this
//! crate has exactly one master key and one active DEK per process.
//!
//! ## Quick start
//!
//! ```ignore
//! let store = Store::connect("sqlite://vault.db").await?;
//! store.migrate().await?;
//!
//! let hierarchy = KeyHierarchy::new(
//!     store.clone(),
//!     Box::new(TracingAuditSink),
//!     &attestation_report.measurement,
//!     &attestation_report.platform_version,
//! )?;
//! let vault = CredentialVault::new(store, hierarchy, Box::new(TracingAuditSink));
//!
//! let meta = vault.create(new_credential).await?;
//! vault.with_decrypted(meta.id, |cred| cred.api_key.clone()).await?;
//! ```

pub mod audit;
pub mod error;
pub mod hierarchy;
mod retry;
pub mod storage;
pub mod types;
pub mod vault;

pub use audit::{AuditAction, AuditEvent, AuditSinkSync, InMemoryAuditSink, TracingAuditSink};
pub use error::{HierarchyError, VaultError};
pub use hierarchy::{derive_master_key, KeyHierarchy};
pub use storage::Store;
pub use types::{
    CredentialMetadata, CredentialRecord, DecryptedCredential, DekRecord, EncryptedField,
    MarketBreakdown, MasterKeyId, NewCredential, NewSnapshot, SnapshotRecord, SyncStatusRecord,
};
pub use vault::CredentialVault;

#[cfg(test)]
mod tests {
    use super::*;
    use zeroize::Zeroizing;

    async fn test_store() -> Store {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    fn test_hierarchy(store: Store) -> KeyHierarchy {
        KeyHierarchy::new(
            store,
            Box::new(InMemoryAuditSink::new()),
            b"test-measurement-bytes",
            "",
        )
        .unwrap()
    }

    fn sample_credential(user_uid: &str, exchange: &str, label: &str) -> NewCredential {
        NewCredential {
            user_uid: user_uid.to_string(),
            exchange: exchange.to_string(),
            label: label.to_string(),
            api_key: Zeroizing::new("ak-12345".to_string()),
            api_secret: Zeroizing::new("sk-67890".to_string()),
            passphrase: Some(Zeroizing::new("hunter2".to_string())),
            sync_interval_minutes: 60,
        }
    }

    // === Master key derivation ===

    #[test]
    fn master_key_derivation_is_deterministic() {
        let (id_a, key_a) = derive_master_key(b"measurement", "v1").unwrap();
        let (id_b, key_b) = derive_master_key(b"measurement", "v1").unwrap();
        assert_eq!(id_a, id_b);
        assert_eq!(*key_a, *key_b);
    }

    #[test]
    fn master_key_derivation_is_measurement_sensitive() {
        let (id_a, _) = derive_master_key(b"measurement-one", "").unwrap();
        let (id_b, _) = derive_master_key(b"measurement-two", "").unwrap();
        assert_ne!(id_a, id_b);
    }

    #[test]
    fn master_key_derivation_is_platform_version_sensitive() {
        let (id_a, _) = derive_master_key(b"measurement", "v1").unwrap();
        let (id_b, _) = derive_master_key(b"measurement", "v2").unwrap();
        assert_ne!(id_a, id_b);
    }

    // === Key hierarchy ===

    #[tokio::test]
    async fn hierarchy_needs_initialization_on_empty_store() {
        let store = test_store().await;
        let hierarchy = test_hierarchy(store);
        assert!(hierarchy.needs_initialization().await.unwrap());
    }

    #[tokio::test]
    async fn hierarchy_mints_dek_lazily_on_first_access() {
        let store = test_store().await;
        let hierarchy = test_hierarchy(store);
        assert!(hierarchy.needs_initialization().await.unwrap());
        let _ = hierarchy.get_current_dek().await.unwrap();
        assert!(!hierarchy.needs_initialization().await.unwrap());
    }

    #[tokio::test]
    async fn hierarchy_dek_is_stable_across_calls() {
        let store = test_store().await;
        let hierarchy = test_hierarchy(store);
        let first = hierarchy.get_current_dek().await.unwrap();
        let second = hierarchy.get_current_dek().await.unwrap();
        assert_eq!(*first, *second);
    }

    #[tokio::test]
    async fn hierarchy_dek_survives_cache_eviction() {
        let store = test_store().await;
        let hierarchy = test_hierarchy(store);
        let first = hierarchy.get_current_dek().await.unwrap();
        hierarchy.clear_cache().await;
        let second = hierarchy.get_current_dek().await.unwrap();
        assert_eq!(*first, *second);
    }

    #[tokio::test]
    async fn hierarchy_rotate_dek_changes_the_active_key() {
        let store = test_store().await;
        let hierarchy = test_hierarchy(store);
        let before = hierarchy.get_current_dek().await.unwrap();
        hierarchy.rotate_dek().await.unwrap();
        let after = hierarchy.get_current_dek().await.unwrap();
        assert_ne!(*before, *after);
    }

    #[tokio::test]
    async fn hierarchy_detects_master_key_mismatch() {
        let store = test_store().await;
        let _ = test_hierarchy(store.clone()).get_current_dek().await.unwrap();

        let mismatched = KeyHierarchy::new(
            store,
            Box::new(InMemoryAuditSink::new()),
            b"a-completely-different-measurement",
            "",
        )
        .unwrap();
        assert!(mismatched.needs_migration().await.unwrap());
        let result = mismatched.get_current_dek().await;
        assert!(matches!(result, Err(HierarchyError::MasterKeyMismatch { .. })));
    }

    #[tokio::test]
    async fn hierarchy_migrate_to_new_master_recovers_original_dek() {
        let store = test_store().await;
        let old_hierarchy = test_hierarchy(store.clone());
        let original_dek = old_hierarchy.get_current_dek().await.unwrap();
        let (_, old_master) = derive_master_key(b"test-measurement-bytes", "").unwrap();

        let new_hierarchy = KeyHierarchy::new(
            store,
            Box::new(InMemoryAuditSink::new()),
            b"a-completely-different-measurement",
            "",
        )
        .unwrap();
        assert!(new_hierarchy.needs_migration().await.unwrap());
        assert!(matches!(
            new_hierarchy.get_current_dek().await,
            Err(HierarchyError::MasterKeyMismatch { .. })
        ));

        new_hierarchy.migrate_to_new_master(&old_master).await.unwrap();
        assert!(!new_hierarchy.needs_migration().await.unwrap());

        let recovered_dek = new_hierarchy.get_current_dek().await.unwrap();
        assert_eq!(*recovered_dek, *original_dek);
    }

    // === Credential vault ===

    #[tokio::test]
    async fn vault_create_and_decrypt_roundtrip() {
        let store = test_store().await;
        let hierarchy = test_hierarchy(store.clone());
        let vault = CredentialVault::new(store, hierarchy, Box::new(InMemoryAuditSink::new()));

        let meta = vault
            .create(sample_credential("user-1", "binance", "main"))
            .await
            .unwrap();

        let api_key = vault
            .with_decrypted(meta.id, |cred| cred.api_key.to_string())
            .await
            .unwrap();
        assert_eq!(api_key, "ak-12345");
    }

    #[tokio::test]
    async fn vault_rejects_duplicate_connection() {
        let store = test_store().await;
        let hierarchy = test_hierarchy(store.clone());
        let vault = CredentialVault::new(store, hierarchy, Box::new(InMemoryAuditSink::new()));

        vault.create(sample_credential("user-1", "binance", "main")).await.unwrap();
        let result = vault.create(sample_credential("user-1", "binance", "main")).await;
        assert!(matches!(result, Err(VaultError::DuplicateConnection)));
    }

    #[tokio::test]
    async fn vault_allows_same_credentials_under_different_label() {
        let store = test_store().await;
        let hierarchy = test_hierarchy(store.clone());
        let vault = CredentialVault::new(store, hierarchy, Box::new(InMemoryAuditSink::new()));

        vault.create(sample_credential("user-1", "binance", "main")).await.unwrap();
        let result = vault.create(sample_credential("user-1", "binance", "backup")).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn vault_list_by_user_excludes_other_users() {
        let store = test_store().await;
        let hierarchy = test_hierarchy(store.clone());
        let vault = CredentialVault::new(store, hierarchy, Box::new(InMemoryAuditSink::new()));

        vault.create(sample_credential("user-1", "binance", "main")).await.unwrap();
        vault.create(sample_credential("user-2", "binance", "main")).await.unwrap();

        let listing = vault.list_by_user("user-1", true).await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].user_uid, "user-1");
    }

    #[tokio::test]
    async fn vault_deactivate_hides_from_active_listing() {
        let store = test_store().await;
        let hierarchy = test_hierarchy(store.clone());
        let vault = CredentialVault::new(store, hierarchy, Box::new(InMemoryAuditSink::new()));

        let meta = vault.create(sample_credential("user-1", "binance", "main")).await.unwrap();
        vault.deactivate(meta.id).await.unwrap();

        let active = vault.list_by_user("user-1", true).await.unwrap();
        assert!(active.is_empty());
        let all = vault.list_by_user("user-1", false).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn vault_decrypt_unknown_connection_not_found() {
        let store = test_store().await;
        let hierarchy = test_hierarchy(store.clone());
        let vault = CredentialVault::new(store, hierarchy, Box::new(InMemoryAuditSink::new()));

        let result = vault.with_decrypted(999, |cred| cred.api_key.to_string()).await;
        assert!(matches!(result, Err(VaultError::NotFound)));
    }

    #[tokio::test]
    async fn vault_count_active_for_user_tracks_creations_and_deactivations() {
        let store = test_store().await;
        let hierarchy = test_hierarchy(store.clone());
        let vault = CredentialVault::new(store, hierarchy, Box::new(InMemoryAuditSink::new()));

        let a = vault.create(sample_credential("user-1", "binance", "main")).await.unwrap();
        vault.create(sample_credential("user-1", "binance", "secondary")).await.unwrap();
        assert_eq!(vault.count_active_for_user("user-1").await.unwrap(), 2);

        vault.deactivate(a.id).await.unwrap();
        assert_eq!(vault.count_active_for_user("user-1").await.unwrap(), 1);
    }
}
