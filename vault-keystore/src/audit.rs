//! Audit logging: every key-hierarchy and credential-vault operation emits
//! a structured event. Sinks are pluggable
//! (`AuditSinkSync`, an in-memory sink for tests, a `tracing`-backed sink
//! for production) with the event vocabulary narrowed to this system's
//! operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

/// What happened.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AuditAction {
    MasterKeyDerived { master_key_id: String },
    DekGenerated { master_key_id: String },
    DekRotated { master_key_id: String },
    DekMigrated { from_master_key_id: String, to_master_key_id: String },
    CredentialCreated { connection_id: i64 },
    CredentialDuplicateRejected,
    CredentialDeduplicationWarning { existing_connection_id: i64 },
    CredentialDecrypted { connection_id: i64 },
    CredentialDecryptionFailed { connection_id: i64 },
    CredentialUpdated { connection_id: i64 },
    CredentialDeactivated { connection_id: i64 },
    CredentialDeleted { connection_id: i64 },
}

/// A structured audit event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub actor: String,
    pub success: bool,
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn new(action: AuditAction) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            actor: "system".into(),
            success: true,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_failure(mut self) -> Self {
        self.success = false;
        self
    }
}

/// Where audit events go.
pub trait AuditSinkSync: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Logs events via the `tracing` crate — the production default.
pub struct TracingAuditSink;

impl AuditSinkSync for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        tracing::info!(
            timestamp = %event.timestamp,
            action = ?event.action,
            actor = %event.actor,
            success = event.success,
            detail = ?event.detail,
            "vault audit"
        );
    }
}

/// Collects events in memory, for tests and the scheduler's own audit
/// surface.
pub struct InMemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }
}

impl Default for InMemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSinkSync for InMemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.try_lock() {
            events.push(event);
        }
    }
}
