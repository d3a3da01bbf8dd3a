//! In-enclave TLS identity: a process-lifetime ECDSA P-256 key pair and a
//! self-signed X.509 certificate, generated once and memoized.

use std::sync::OnceLock;

use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, KeyPair, SerialNumber};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use zeroize::Zeroizing;

use crate::error::TlsIdentityError;

const SUBJECT_COMMON_NAME: &str = "confidential-vault-enclave";
const VALIDITY_DAYS: i64 = 365;

/// The enclave's TLS credentials: private key, self-signed certificate, and
/// the certificate's fingerprint.
#[derive(Clone)]
pub struct TlsCredentials {
    private_key_der: Zeroizing<Vec<u8>>,
    certificate_der: Vec<u8>,
    certificate_pem: String,
    fingerprint: String,
}

impl TlsCredentials {
    pub fn private_key_der(&self) -> &[u8] {
        &self.private_key_der
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    /// `SHA-256(DER(certificate))`, uppercase colon-separated hex.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

/// Generates and memoizes the enclave's TLS identity. `get_credentials` is
/// idempotent: the first call generates the key pair and certificate, every
/// subsequent call returns the cached result.
#[derive(Default)]
pub struct TlsIdentity {
    credentials: OnceLock<TlsCredentials>,
}

impl TlsIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_credentials(&self) -> Result<&TlsCredentials, TlsIdentityError> {
        if let Some(creds) = self.credentials.get() {
            return Ok(creds);
        }
        let creds = generate_credentials()?;
        // OnceLock::set races harmlessly: the loser's `creds` is dropped
        // (and its private key zeroized) and `get` below returns the
        // winner's value.
        let _ = self.credentials.set(creds);
        Ok(self.credentials.get().expect("just set"))
    }
}

fn generate_credentials() -> Result<TlsCredentials, TlsIdentityError> {
    let key_pair = KeyPair::generate(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| TlsIdentityError(e.to_string()))?;

    let mut params = CertificateParams::new(vec![SUBJECT_COMMON_NAME.to_string()]);
    params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, SUBJECT_COMMON_NAME);
    dn.push(DnType::OrganizationName, "confidential-vault");
    params.distinguished_name = dn;

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(VALIDITY_DAYS);

    let mut serial_bytes = [0u8; 16];
    getrandom::getrandom(&mut serial_bytes).map_err(|e| TlsIdentityError(e.to_string()))?;
    params.serial_number = Some(SerialNumber::from_slice(&serial_bytes));

    params.key_pair = Some(key_pair);

    let cert = Certificate::from_params(params).map_err(|e| TlsIdentityError(e.to_string()))?;

    let certificate_der = cert
        .serialize_der()
        .map_err(|e| TlsIdentityError(e.to_string()))?;
    let certificate_pem = cert
        .serialize_pem()
        .map_err(|e| TlsIdentityError(e.to_string()))?;
    let private_key_der = Zeroizing::new(cert.serialize_private_key_der());

    let fingerprint = fingerprint_hex(&certificate_der);

    Ok(TlsCredentials {
        private_key_der,
        certificate_der,
        certificate_pem,
        fingerprint,
    })
}

fn fingerprint_hex(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    digest
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}
