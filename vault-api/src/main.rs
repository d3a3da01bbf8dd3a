//! Confidential credential vault — trust bootstrap, admission endpoint,
//! and daily snapshot scheduler.
//!
//! Configuration (environment variables, see [`config::Config`]):
//!   VAULT_MODE                     - "production" or "development" (default: development)
//!   VAULT_PORT                     - Listen port (default: 3050)
//!   VAULT_DATABASE_URL             - sqlite connection string (default: sqlite://vault.db)
//!   VAULT_ATTESTATION_BYPASS       - "1"/"true" to continue past unverified attestation (dev only)
//!   VAULT_LOG_FORMAT               - "json" for structured logging, "pretty" for dev
//!   VAULT_RATE_LIMIT_MAX_REQUESTS  - submissions per sliding window (default: 5)
//!   VAULT_RATE_LIMIT_WINDOW_SECS   - sliding window length in seconds (default: 900)
//!   VAULT_INSTANCE_METADATA_ATTESTATION_URL - cloud metadata attestation endpoint, fallback
//!                                    acquisition path when no local guest device is present
//!
//! Startup runs [`bootstrap::bootstrap`] to completion before anything else
//! starts: TLS identity, E2E identity, attestation, database, key
//! hierarchy. The admission endpoint and the daily scheduler then run
//! concurrently against the resulting [`bootstrap::TrustedState`].

mod admission;
mod bootstrap;
mod config;
mod connector;
mod error;
mod scheduler;

use std::sync::Arc;

use config::{Config, LogFormat};

#[tokio::main]
async fn main() {
    let config = Config::load();
    init_tracing(config.log_format);

    tracing::info!(mode = ?config.mode, port = config.port, "starting vault-api");

    let trust = match bootstrap::bootstrap(&config).await {
        Ok(trust) => trust,
        Err(e) => {
            tracing::error!(error = %e, "bootstrap failed, aborting");
            std::process::exit(1);
        }
    };

    tracing::info!(
        tls_fingerprint = %trust.tls_identity.get_credentials().expect("bootstrapped").fingerprint(),
        measurement = %hex::encode(trust.attestation.measurement),
        vcek_chain_verified = trust.attestation.vcek_chain_verified,
        "trust bootstrap complete"
    );

    let mut scheduler = scheduler::Scheduler::new(trust.store.clone(), trust.vault.clone(), &config);
    register_connectors(&mut scheduler);
    let scheduler = Arc::new(scheduler);

    let scheduler_for_loop = scheduler.clone();
    tokio::spawn(async move {
        scheduler_for_loop.run_daily().await;
    });

    let trust = Arc::new(trust);
    if let Err(e) = admission::serve(trust, &config).await {
        tracing::error!(error = %e, "admission endpoint exited");
        std::process::exit(1);
    }
}

/// No real exchange connectors ship here.
/// An operator deployment registers its own `Connector` implementations
/// here before the scheduler's first tick.
fn register_connectors(_scheduler: &mut scheduler::Scheduler) {}

fn init_tracing(log_format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "vault_api=info,tower_http=info".into());
    match log_format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(env_filter)
                .with_target(true)
                .with_thread_ids(true)
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
        }
    }
}
