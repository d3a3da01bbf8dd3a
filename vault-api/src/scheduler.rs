//! Daily snapshot scheduler: a hard-wired daily UTC tick
//! that pulls a balance snapshot per active credential connection and
//! writes each user's batch atomically. Built around a `cron::Schedule`
//! drive loop and an `AtomicBool` run-state guard that enforces a single
//! flight at a time, whether triggered by the clock or manually.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use cron::Schedule;
use zeroize::Zeroizing;

use vault_keystore::{CredentialVault, MarketBreakdown, NewSnapshot, Store};

use crate::config::Config;
use crate::connector::{Connector, ConnectorCredentials, ConnectorError, GlobalBalance};
use crate::error::SchedulerError;

const DAILY_UTC_MIDNIGHT: &str = "0 0 0 * * *";

pub struct Scheduler {
    store: Store,
    vault: Arc<CredentialVault>,
    connectors: HashMap<String, Box<dyn Connector>>,
    connector_timeout: Duration,
    connector_pacing: Duration,
    /// `false` = idle, `true` = a tick is in flight. A manual trigger and
    /// the scheduled tick share this guard, so they can never overlap.
    running: AtomicBool,
}

impl Scheduler {
    pub fn new(store: Store, vault: Arc<CredentialVault>, config: &Config) -> Self {
        Self {
            store,
            vault,
            connectors: HashMap::new(),
            connector_timeout: config.connector_timeout,
            connector_pacing: config.connector_pacing,
            running: AtomicBool::new(false),
        }
    }

    pub fn register_connector(&mut self, connector: Box<dyn Connector>) {
        self.connectors.insert(connector.exchange().to_string(), connector);
    }

    /// Run the daily drive loop forever. Never returns under normal
    /// operation; a panic inside one tick is caught by `catch_unwind`-free
    /// design — every fallible step here returns a `Result` instead.
    pub async fn run_daily(self: Arc<Self>) {
        let schedule = Schedule::from_str(DAILY_UTC_MIDNIGHT)
            .expect("DAILY_UTC_MIDNIGHT is a fixed, valid cron expression");

        loop {
            let now = Utc::now();
            let next = schedule
                .upcoming(Utc)
                .next()
                .expect("a fixed daily cron schedule always has a next occurrence");
            let sleep_for = (next - now).to_std().unwrap_or(Duration::from_secs(0));
            tracing::info!(next_run = %next, "scheduler sleeping until next tick");
            tokio::time::sleep(sleep_for).await;

            if let Err(e) = self.run_tick("scheduled").await {
                tracing::error!(error = %e, "scheduled snapshot tick failed");
            }
        }
    }

    /// Invoked from the admission surface or an operator command. Shares
    /// the same `running` guard as the scheduled tick — refuses to start a
    /// second tick while one is in flight rather than queueing it.
    pub async fn trigger_manual_sync(&self) -> Result<(), SchedulerError> {
        self.run_tick("manual").await
    }

    async fn run_tick(&self, triggered_by: &str) -> Result<(), SchedulerError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!(triggered_by, "snapshot tick already in progress, skipping");
            self.store
                .record_sync_skipped(triggered_by)
                .await
                .map_err(|e| SchedulerError::Database(e.to_string()))?;
            return Ok(());
        }

        let result = self.run_tick_inner(triggered_by).await;
        self.running.store(false, Ordering::Release);
        result
    }

    async fn run_tick_inner(&self, triggered_by: &str) -> Result<(), SchedulerError> {
        let started = Instant::now();
        let sync_id = self
            .store
            .record_sync_start(triggered_by)
            .await
            .map_err(|e| SchedulerError::Database(e.to_string()))?;

        let users = self
            .store
            .list_active_users()
            .await
            .map_err(|e| SchedulerError::Database(e.to_string()))?;

        let mut snapshots_saved = 0i64;
        let mut users_aborted = 0i64;
        let timestamp = Utc::now();

        for user_uid in users {
            match self.build_user_batch(&user_uid, timestamp).await {
                Ok(batch) if !batch.is_empty() => {
                    let saved = self
                        .store
                        .insert_snapshots_atomic(&batch)
                        .await
                        .map_err(|e| SchedulerError::Database(e.to_string()))?;
                    snapshots_saved += saved as i64;
                }
                Ok(_) => {
                    // No active connections for this user; nothing to save,
                    // not an abort.
                }
                Err(reason) => {
                    tracing::warn!(user_uid, reason, "aborting snapshot batch for user");
                    users_aborted += 1;
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as i64;
        self.store
            .record_sync_finish(sync_id, duration_ms, snapshots_saved, users_aborted)
            .await
            .map_err(|e| SchedulerError::Database(e.to_string()))?;

        tracing::info!(
            triggered_by,
            duration_ms,
            snapshots_saved,
            users_aborted,
            "snapshot tick complete"
        );
        Ok(())
    }

    /// Build every snapshot for one user's active connections. Returns
    /// `Err` (the abort reason) as soon as any connector call fails —
    /// nothing built so far for this user is persisted: the batch is
    /// all-or-nothing.
    async fn build_user_batch(
        &self,
        user_uid: &str,
        timestamp: chrono::DateTime<Utc>,
    ) -> Result<Vec<NewSnapshot>, String> {
        let connections = self
            .vault
            .list_by_user(user_uid, true)
            .await
            .map_err(|e| e.to_string())?;

        let mut batch = Vec::with_capacity(connections.len());
        let mut first = true;

        for conn in connections {
            if !first {
                tokio::time::sleep(self.connector_pacing).await;
            }
            first = false;

            let connector = self
                .connectors
                .get(&conn.exchange)
                .ok_or_else(|| format!("no connector registered for exchange {}", conn.exchange))?;

            let creds = self
                .vault
                .with_decrypted(conn.id, |d| ConnectorCredentials {
                    api_key: Zeroizing::new(d.api_key.to_string()),
                    api_secret: Zeroizing::new(d.api_secret.to_string()),
                    passphrase: d.passphrase.as_ref().map(|p| Zeroizing::new(p.to_string())),
                })
                .await
                .map_err(|e| e.to_string())?;

            let (balance, breakdown) = self
                .pull_balance(connector.as_ref(), &creds)
                .await
                .map_err(|e| e.to_string())?;

            batch.push(NewSnapshot {
                user_uid: conn.user_uid.clone(),
                exchange: conn.exchange.clone(),
                label: conn.label.clone(),
                timestamp,
                total_equity: balance.total_equity,
                realized_balance: balance.realized_balance,
                unrealized_pnl: balance.unrealized_pnl,
                deposits: balance.deposits,
                withdrawals: balance.withdrawals,
                breakdown_by_market: breakdown,
            });
        }

        Ok(batch)
    }

    /// Prefer a connector's per-market breakdown when it exposes one, the
    /// richest balance shape available; fall back to the required
    /// aggregate `get_balance`.
    async fn pull_balance(
        &self,
        connector: &dyn Connector,
        creds: &ConnectorCredentials,
    ) -> Result<(GlobalBalance, Vec<MarketBreakdown>), ConnectorError> {
        let balance = self.with_timeout(connector.get_balance(creds)).await?;

        let breakdown = if let Some(cap) = connector.as_market_breakdown() {
            self.with_timeout(cap.get_current_positions())
                .await?
                .into_iter()
                .map(|e| MarketBreakdown { market: e.market, equity: e.equity })
                .collect()
        } else {
            Vec::new()
        };

        Ok((balance, breakdown))
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, ConnectorError>>,
    ) -> Result<T, ConnectorError> {
        tokio::time::timeout(self.connector_timeout, fut)
            .await
            .map_err(|_| ConnectorError::Timeout)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::mock::MockConnector;
    use vault_keystore::{KeyHierarchy, NewCredential, TracingAuditSink};
    use zeroize::Zeroizing;

    async fn test_scheduler() -> (Scheduler, Arc<CredentialVault>) {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        let measurement = [7u8; 48];
        let hierarchy = KeyHierarchy::new(store.clone(), Box::new(TracingAuditSink), &measurement, "test")
            .unwrap();
        let vault = Arc::new(CredentialVault::new(store.clone(), hierarchy, Box::new(TracingAuditSink)));

        let config = Config {
            mode: crate::config::RunMode::Development,
            port: 0,
            database_url: "sqlite::memory:".into(),
            attestation_bypass: true,
            log_format: crate::config::LogFormat::Pretty,
            rate_limit_max_requests: 5,
            rate_limit_window: Duration::from_secs(900),
            connector_timeout: Duration::from_secs(5),
            connector_pacing: Duration::from_millis(1),
            instance_metadata_attestation_url: None,
        };

        let mut scheduler = Scheduler::new(store, vault.clone(), &config);
        scheduler.register_connector(Box::new(MockConnector::new(
            "kraken",
            GlobalBalance { total_equity: 100.0, ..Default::default() },
        )));
        (scheduler, vault)
    }

    #[tokio::test]
    async fn tick_saves_snapshot_for_healthy_connector() {
        let (scheduler, vault) = test_scheduler().await;
        vault
            .create(NewCredential {
                user_uid: "user-1".into(),
                exchange: "kraken".into(),
                label: "main".into(),
                api_key: Zeroizing::new("key".into()),
                api_secret: Zeroizing::new("secret".into()),
                passphrase: None,
                sync_interval_minutes: 60,
            })
            .await
            .unwrap();

        scheduler.trigger_manual_sync().await.unwrap();

        let status = scheduler.store.last_sync_status().await.unwrap().unwrap();
        assert_eq!(status.snapshots_saved, 1);
        assert_eq!(status.users_aborted, 0);
    }

    #[tokio::test]
    async fn tick_aborts_user_batch_on_connector_failure() {
        let (mut scheduler, vault) = test_scheduler().await;
        scheduler
            .connectors
            .insert("deribit".into(), Box::new(MockConnector::failing("deribit")));
        vault
            .create(NewCredential {
                user_uid: "user-2".into(),
                exchange: "deribit".into(),
                label: "main".into(),
                api_key: Zeroizing::new("key".into()),
                api_secret: Zeroizing::new("secret".into()),
                passphrase: None,
                sync_interval_minutes: 60,
            })
            .await
            .unwrap();

        scheduler.trigger_manual_sync().await.unwrap();

        let status = scheduler.store.last_sync_status().await.unwrap().unwrap();
        assert_eq!(status.snapshots_saved, 0);
        assert_eq!(status.users_aborted, 1);
        assert!(scheduler.store.snapshots_for_user("user-2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_manual_sync_is_refused_while_running() {
        let (scheduler, _vault) = test_scheduler().await;
        let scheduler = Arc::new(scheduler);

        scheduler
            .running
            .store(true, Ordering::Release);

        scheduler.trigger_manual_sync().await.unwrap();
        let status = scheduler.store.last_sync_status().await.unwrap().unwrap();
        assert!(status.skipped_overlap);

        scheduler.running.store(false, Ordering::Release);
    }
}
