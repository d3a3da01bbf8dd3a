//! Startup configuration. A single typed [`Config`] is assembled once in
//! `main` before [`crate::bootstrap::bootstrap`] runs; no other module
//! reads `std::env` afterward.
//!
//! In development, values come from a `.env` file via `dotenvy`. In
//! production, the database URL and any platform-specific values are
//! expected to come from the cloud instance metadata service rather than
//! operator-supplied environment variables — `vault-attest`'s own
//! instance-metadata attestation fetch follows the same convention.

use std::time::Duration;

/// Runtime posture: whether an unverified attestation report aborts the
/// process (`Production`) or is logged and allowed to continue given an
/// explicit bypass (`Development`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    Development,
    Production,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub mode: RunMode,
    pub port: u16,
    pub database_url: String,
    /// Development-only override: continue past an unverified attestation
    /// report instead of aborting. Refused in `RunMode::Production`.
    pub attestation_bypass: bool,
    pub log_format: LogFormat,
    pub rate_limit_max_requests: u32,
    pub rate_limit_window: Duration,
    pub connector_timeout: Duration,
    pub connector_pacing: Duration,
    /// Cloud instance metadata endpoint for the fallback attestation
    /// acquisition path, handed to `vault_attest::AttestationProvider` at
    /// construction time rather than read from `std::env` after bootstrap.
    pub instance_metadata_attestation_url: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

const DEFAULT_PORT: u16 = 3050;
const DEFAULT_DATABASE_URL: &str = "sqlite://vault.db";
const DEFAULT_RATE_LIMIT_MAX_REQUESTS: u32 = 5;
const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(15 * 60);
const DEFAULT_CONNECTOR_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CONNECTOR_PACING: Duration = Duration::from_millis(250);

impl Config {
    /// Load configuration once at process start. Loads a `.env` file (if
    /// present) before reading variables, so development can keep secrets
    /// out of the shell; in production the same variables are expected to
    /// be populated by the platform from instance metadata before this
    /// process starts.
    pub fn load() -> Self {
        let _ = dotenvy::dotenv();

        let mode = match std::env::var("VAULT_MODE").as_deref() {
            Ok("production") => RunMode::Production,
            _ => RunMode::Development,
        };

        let port = std::env::var("VAULT_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let database_url =
            std::env::var("VAULT_DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        let attestation_bypass = std::env::var("VAULT_ATTESTATION_BYPASS")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let log_format = match std::env::var("VAULT_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        let rate_limit_max_requests = std::env::var("VAULT_RATE_LIMIT_MAX_REQUESTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_RATE_LIMIT_MAX_REQUESTS);

        let rate_limit_window_secs: u64 = std::env::var("VAULT_RATE_LIMIT_WINDOW_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_RATE_LIMIT_WINDOW.as_secs());

        let instance_metadata_attestation_url =
            std::env::var("VAULT_INSTANCE_METADATA_ATTESTATION_URL").ok();

        Self {
            mode,
            port,
            database_url,
            attestation_bypass,
            log_format,
            rate_limit_max_requests,
            rate_limit_window: Duration::from_secs(rate_limit_window_secs),
            connector_timeout: DEFAULT_CONNECTOR_TIMEOUT,
            connector_pacing: DEFAULT_CONNECTOR_PACING,
            instance_metadata_attestation_url,
        }
    }

    pub fn is_production(&self) -> bool {
        self.mode == RunMode::Production
    }
}
