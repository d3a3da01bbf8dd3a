//! Trust bootstrap: the ordered startup sequence that
//! stands up every process-singleton the rest of the service depends on.
//! Each step's completion is a precondition for the next; the sequence
//! short-circuits on the first failure.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use vault_attest::{AttestationProvider, AttestationReport, TlsIdentity};
use vault_crypto::e2e::E2eIdentity;
use vault_keystore::{CredentialVault, KeyHierarchy, Store, TracingAuditSink};

use crate::config::Config;
use crate::error::BootstrapError;

/// Everything the admission endpoint and scheduler need, assembled once
/// during bootstrap and handed around by reference.
pub struct TrustedState {
    pub tls_identity: TlsIdentity,
    pub e2e_identity: E2eIdentity,
    pub attestation: AttestationReport,
    pub vault: Arc<CredentialVault>,
    /// A handle to the same pool `vault` uses. The scheduler needs direct
    /// store access (`list_active_users`, `insert_snapshots_atomic`,
    /// `record_sync_*`) that sits below the vault's credential-scoped API.
    pub store: Store,
}

/// Run the ordered startup sequence. Returns `Ok(TrustedState)` only once
/// every step has succeeded, including attestation verification unless
/// `config.attestation_bypass` is set (development only — refused in
/// production by [`Config::load`]'s own `VAULT_MODE` gate plus the check
/// below).
pub async fn bootstrap(config: &Config) -> Result<TrustedState, BootstrapError> {
    check_memory_hygiene();

    let tls_identity = TlsIdentity::new();
    let tls_credentials = tls_identity
        .get_credentials()
        .map_err(|e| BootstrapError::TlsIdentity(e.to_string()))?;
    tracing::info!(fingerprint = %tls_credentials.fingerprint(), "TLS identity generated");

    let e2e_identity = E2eIdentity::generate();
    let e2e_public_key_pem = e2e_identity
        .public_key_pem()
        .map_err(|e| BootstrapError::E2eIdentity(e.to_string()))?;
    tracing::info!("E2E identity generated");

    let request_data =
        build_request_data(tls_credentials.certificate_der(), e2e_public_key_pem.as_bytes());

    let attestation_provider = AttestationProvider::new(config.instance_metadata_attestation_url.clone());
    let attestation = attestation_provider.get_report(request_data).await;

    if !attestation.vcek_chain_verified {
        let detail = attestation.error.clone().unwrap_or_else(|| "unknown".into());
        if config.is_production() {
            return Err(BootstrapError::AttestationUnverified(detail));
        }
        if !config.attestation_bypass {
            return Err(BootstrapError::AttestationUnverified(format!(
                "{detail} (set VAULT_ATTESTATION_BYPASS=1 to continue in development)"
            )));
        }
        tracing::warn!(
            reason = %detail,
            "continuing with unverified attestation: VAULT_ATTESTATION_BYPASS=1"
        );
    }

    let store = Store::connect(&config.database_url)
        .await
        .map_err(|e| BootstrapError::Database(e.to_string()))?;
    store
        .migrate()
        .await
        .map_err(|e| BootstrapError::Database(e.to_string()))?;

    let hierarchy = KeyHierarchy::new(
        store.clone(),
        Box::new(TracingAuditSink),
        &attestation.measurement,
        &attestation.platform_version,
    )
    .map_err(|e| BootstrapError::KeyHierarchy(e.to_string()))?;

    if hierarchy.needs_migration().await.map_err(|e| BootstrapError::KeyHierarchy(e.to_string()))? {
        tracing::warn!(
            master_key_id = %hierarchy.master_key_id(),
            "active DEK wrapped under a different master key; get_current_dek will fail until \
             an operator runs migrate_to_new_master"
        );
    } else if hierarchy
        .needs_initialization()
        .await
        .map_err(|e| BootstrapError::KeyHierarchy(e.to_string()))?
    {
        // Mint the first DEK now rather than on the first credential
        // submission, so a cold-start admission request doesn't pay the
        // initialization cost.
        hierarchy
            .get_current_dek()
            .await
            .map_err(|e| BootstrapError::KeyHierarchy(e.to_string()))?;
    }

    let vault = Arc::new(CredentialVault::new(store.clone(), hierarchy, Box::new(TracingAuditSink)));

    Ok(TrustedState {
        tls_identity,
        e2e_identity,
        attestation,
        vault,
        store,
    })
}

/// `request_data = SHA-256(TLS-cert DER) || SHA-256(E2E-pubkey PEM)`,
/// exactly 64 bytes.
fn build_request_data(tls_cert_der: &[u8], e2e_public_key_pem: &[u8]) -> [u8; 64] {
    let mut out = [0u8; 64];
    out[..32].copy_from_slice(&Sha256::digest(tls_cert_der));
    out[32..].copy_from_slice(&Sha256::digest(e2e_public_key_pem));
    out
}

/// Disable core dumps and, where observable, note whether ptrace is
/// restricted. Best-effort: failures are logged, never fatal — a enclave
/// without this posture is still more trustworthy than refusing to start.
#[cfg(target_os = "linux")]
fn check_memory_hygiene() {
    // SAFETY: PR_SET_DUMPABLE with arg2=0 has no preconditions and cannot
    // invalidate any Rust invariant; we only inspect its return value.
    let result = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0, 0, 0, 0) };
    if result != 0 {
        tracing::warn!("failed to disable core dumps (PR_SET_DUMPABLE)");
    } else {
        tracing::info!("core dumps disabled");
    }

    match std::fs::read_to_string("/proc/sys/kernel/yama/ptrace_scope") {
        Ok(scope) if scope.trim() == "0" => {
            tracing::warn!("ptrace_scope=0: any process owned by this user may attach");
        }
        Ok(scope) => tracing::info!(ptrace_scope = %scope.trim(), "ptrace restriction in place"),
        Err(_) => tracing::debug!("ptrace_scope not observable on this kernel"),
    }
}

#[cfg(not(target_os = "linux"))]
fn check_memory_hygiene() {
    tracing::debug!("memory-hygiene posture check is a no-op on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_data_is_64_bytes_and_binds_both_digests() {
        let cert = b"fake-certificate-der";
        let pubkey = b"fake-e2e-public-key";
        let request_data = build_request_data(cert, pubkey);
        assert_eq!(request_data.len(), 64);
        assert_eq!(&request_data[..32], Sha256::digest(cert).as_slice());
        assert_eq!(&request_data[32..], Sha256::digest(pubkey).as_slice());
    }
}
