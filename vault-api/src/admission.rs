//! Admission endpoint: the only inbound HTTPS surface.
//! Three idempotent reads and one mutating write, gated by TLS and an
//! ECIES envelope rather than a bearer token, with a sliding-window rate
//! limiter guarding the one mutating route.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use zeroize::Zeroizing;

use vault_crypto::wire::Envelope;
use vault_keystore::{NewCredential, VaultError};

use crate::bootstrap::TrustedState;
use crate::config::Config;

const ATTESTATION_HINT: &str =
    "submit credentials as an ECIES envelope sealed against the E2E public key from GET /api/v1/attestation";

struct RateLimiter {
    windows: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            max_requests,
            window,
        }
    }

    /// Evict timestamps older than the window, then admit the request if
    /// fewer than `max_requests` remain in the trailing window. Returns
    /// the retry-after duration on rejection.
    async fn check(&self, ip: IpAddr) -> Result<(), Duration> {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();
        let entry = windows.entry(ip).or_insert_with(VecDeque::new);
        evict_stale(entry, now, self.window);

        if entry.len() as u32 >= self.max_requests {
            let oldest = *entry.front().expect("len >= max_requests > 0 implies non-empty");
            return Err(self.window - now.duration_since(oldest));
        }
        entry.push_back(now);
        Ok(())
    }
}

fn evict_stale(entry: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&front) = entry.front() {
        if now.duration_since(front) > window {
            entry.pop_front();
        } else {
            break;
        }
    }
}

async fn cleanup_rate_limiter(limiter: &RateLimiter) {
    let mut windows = limiter.windows.lock().await;
    let now = Instant::now();
    windows.retain(|_, entry| {
        evict_stale(entry, now, limiter.window);
        !entry.is_empty()
    });
}

struct AppState {
    trust: Arc<TrustedState>,
    rate_limiter: RateLimiter,
}

type Shared = Arc<AppState>;

async fn rate_limit_middleware(
    State(state): State<Shared>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: axum::extract::Request,
    next: Next,
) -> impl IntoResponse {
    match state.rate_limiter.check(addr.ip()).await {
        Ok(()) => next.run(req).await.into_response(),
        Err(retry_after) => {
            tracing::warn!(ip = %addr.ip(), "rate limit exceeded on credential submission");
            (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, retry_after.as_secs().to_string())],
                Json(ApiError {
                    error: "rate limit exceeded: at most 5 submissions per 15 minutes".into(),
                }),
            )
                .into_response()
        }
    }
}

#[derive(Serialize)]
struct ApiError {
    error: String,
}

fn bad_request(msg: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (StatusCode::BAD_REQUEST, Json(ApiError { error: msg.into() }))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Serialize)]
struct FingerprintResponse {
    fingerprint: String,
}

async fn tls_fingerprint(State(state): State<Shared>) -> impl IntoResponse {
    let creds = state
        .trust
        .tls_identity
        .get_credentials()
        .expect("TLS identity was generated during bootstrap");
    Json(FingerprintResponse {
        fingerprint: creds.fingerprint().to_string(),
    })
}

#[derive(Serialize)]
struct AttestationResponse {
    measurement: String,
    report_data: String,
    platform_version: String,
    vcek_chain_verified: bool,
    tls_fingerprint: String,
    e2e_public_key: String,
    e2e_public_key_fingerprint: String,
    /// Whether `report_data` binds both the TLS certificate and the E2E
    /// public key currently in force — the check a client performs before
    /// trusting the channel.
    bindings_verified: bool,
}

async fn attestation(State(state): State<Shared>) -> impl IntoResponse {
    let trust = &state.trust;
    let tls_creds = trust
        .tls_identity
        .get_credentials()
        .expect("TLS identity was generated during bootstrap");
    let e2e_public_key_pem = trust
        .e2e_identity
        .public_key_pem()
        .expect("E2E identity was generated during bootstrap");

    use sha2::{Digest, Sha256};
    let expected_tls_digest = Sha256::digest(tls_creds.certificate_der());
    let expected_e2e_digest = Sha256::digest(e2e_public_key_pem.as_bytes());
    let bindings_verified = trust.attestation.report_data[..32] == expected_tls_digest[..]
        && trust.attestation.report_data[32..] == expected_e2e_digest[..];

    Json(AttestationResponse {
        measurement: hex::encode(trust.attestation.measurement),
        report_data: hex::encode(trust.attestation.report_data),
        platform_version: trust.attestation.platform_version.clone(),
        vcek_chain_verified: trust.attestation.vcek_chain_verified,
        tls_fingerprint: tls_creds.fingerprint().to_string(),
        e2e_public_key: e2e_public_key_pem.clone(),
        e2e_public_key_fingerprint: hex::encode(Sha256::digest(e2e_public_key_pem.as_bytes())),
        bindings_verified,
    })
}

#[derive(Deserialize)]
struct ConnectRequest {
    user_uid: String,
    exchange: String,
    label: String,
    #[serde(default)]
    sync_interval_minutes: Option<i64>,
    envelope: Option<Envelope>,
    /// Present only on a rejected plaintext submission, to produce the
    /// precise "no plaintext path" error rather than a generic
    /// missing-field error.
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    api_secret: Option<String>,
}

#[derive(Deserialize)]
struct DecryptedCredentialPayload {
    api_key: String,
    api_secret: String,
    #[serde(default)]
    passphrase: Option<String>,
}

#[derive(Serialize)]
struct ConnectResponse {
    success: bool,
    user_uid: String,
    exchange: String,
    message: String,
}

const DEFAULT_SYNC_INTERVAL_MINUTES: i64 = 60;

async fn connect(
    State(state): State<Shared>,
    Json(req): Json<ConnectRequest>,
) -> impl IntoResponse {
    let Some(envelope) = req.envelope else {
        let had_plaintext = req.api_key.is_some() || req.api_secret.is_some();
        let message = if had_plaintext {
            format!("plaintext credentials are not accepted: {ATTESTATION_HINT}")
        } else {
            format!("missing `envelope` field: {ATTESTATION_HINT}")
        };
        return bad_request(message).into_response();
    };

    let plaintext = match state.trust.e2e_identity.decrypt(&envelope) {
        Ok(p) => p,
        Err(_) => return bad_request("decryption failed").into_response(),
    };

    let payload: DecryptedCredentialPayload = match serde_json::from_slice(&plaintext) {
        Ok(p) => p,
        Err(_) => {
            return bad_request("decrypted payload is not valid JSON matching {api_key, api_secret, passphrase?}")
                .into_response()
        }
    };

    let new_credential = NewCredential {
        user_uid: req.user_uid.clone(),
        exchange: req.exchange.clone(),
        label: req.label,
        api_key: Zeroizing::new(payload.api_key),
        api_secret: Zeroizing::new(payload.api_secret),
        passphrase: payload.passphrase.map(Zeroizing::new),
        sync_interval_minutes: req.sync_interval_minutes.unwrap_or(DEFAULT_SYNC_INTERVAL_MINUTES),
    };

    match state.trust.vault.create(new_credential).await {
        Ok(_meta) => Json(ConnectResponse {
            success: true,
            user_uid: req.user_uid,
            exchange: req.exchange,
            message: "credential stored".into(),
        })
        .into_response(),
        Err(VaultError::DuplicateConnection) => {
            bad_request("already connected").into_response()
        }
        Err(VaultError::Crypto) => bad_request("decryption failed").into_response(),
        Err(VaultError::NotFound) => {
            (StatusCode::INTERNAL_SERVER_ERROR, Json(ApiError { error: "internal error".into() }))
                .into_response()
        }
        Err(VaultError::Transient(msg)) | Err(VaultError::Fatal(msg)) => {
            tracing::error!(error = %msg, "credential store failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ApiError { error: "storage temporarily unavailable".into() }),
            )
                .into_response()
        }
    }
}

/// Build the admission endpoint's router. The rate limiter guards only the
/// mutating write — the three reads are unauthenticated and unlimited,
/// since the sliding-window limit only needs to bound credential
/// submission specifically.
pub fn router(trust: Arc<TrustedState>, config: &Config) -> (Router, Arc<RateLimiterHandle>) {
    let state = Arc::new(AppState {
        trust,
        rate_limiter: RateLimiter::new(config.rate_limit_max_requests, config.rate_limit_window),
    });
    let handle = Arc::new(RateLimiterHandle(state.clone()));

    let connect_route = axum::Router::new()
        .route("/api/v1/credentials/connect", post(connect))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit_middleware));

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let router = Router::new()
        .route("/health", get(health))
        .route("/api/v1/tls/fingerprint", get(tls_fingerprint))
        .route("/api/v1/attestation", get(attestation))
        .merge(connect_route)
        .layer(cors)
        .with_state(state);

    (router, handle)
}

/// Opaque handle so `main` can spawn the periodic rate-limiter cleanup
/// task without reaching into `AppState`'s private fields.
pub struct RateLimiterHandle(Arc<AppState>);

impl RateLimiterHandle {
    pub async fn cleanup_tick(&self) {
        cleanup_rate_limiter(&self.0.rate_limiter).await;
    }
}

/// Serve the admission endpoint over TLS using the enclave-generated
/// certificate; the process refuses to start without TLS material.
/// `trust.tls_identity` was already generated during bootstrap,
/// so the only way this fails is if the in-memory DER the enclave produced
/// itself cannot be parsed as a valid certificate/key pair — a condition
/// worth aborting the process over rather than silently falling back to
/// plaintext.
pub async fn serve(
    trust: Arc<TrustedState>,
    config: &Config,
) -> std::io::Result<()> {
    let tls_creds = trust
        .tls_identity
        .get_credentials()
        .expect("TLS identity was generated during bootstrap")
        .clone();
    let tls_config = axum_server::tls_rustls::RustlsConfig::from_der(
        vec![tls_creds.certificate_der().to_vec()],
        tls_creds.private_key_der().to_vec(),
    )
    .await
    .expect("enclave-generated TLS material must be a valid cert/key pair");

    let (router, rate_limiter) = router(trust, config);

    let cleanup_handle = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            cleanup_handle.cleanup_tick().await;
        }
    });

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port)
        .parse()
        .expect("host:port is always a valid socket address");
    tracing::info!(%addr, fingerprint = %tls_creds.fingerprint(), "admission endpoint listening (TLS)");
    axum_server::bind_rustls(addr, tls_config)
        .serve(router.into_make_service_with_connect_info::<SocketAddr>())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn sliding_window_admits_five_then_rejects_sixth() {
        let limiter = RateLimiter::new(5, Duration::from_secs(900));
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        for _ in 0..5 {
            assert!(limiter.check(ip).await.is_ok());
        }
        let result = limiter.check(ip).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn sliding_window_is_per_address() {
        let limiter = RateLimiter::new(1, Duration::from_secs(900));
        let a: IpAddr = "127.0.0.1".parse().unwrap();
        let b: IpAddr = "127.0.0.2".parse().unwrap();
        assert!(limiter.check(a).await.is_ok());
        assert!(limiter.check(b).await.is_ok());
        assert!(limiter.check(a).await.is_err());
    }
}
