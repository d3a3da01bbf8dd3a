//! The relational persistence layer: `sqlx` against SQLite, so the
//! workspace runs standalone without an external database process. Owns
//! the four record shapes — `data_encryption_keys`,
//! `exchange_connections` (credential records), `snapshot_data`, and
//! `sync_status` — plus the transactional multi-upsert the scheduler
//! needs for its per-user atomic write.

use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::retry::with_retry;
use crate::types::{
    CredentialRecord, DekRecord, NewCredential, NewSnapshot, SnapshotRecord, SyncStatusRecord,
};

/// Default bounded connection pool size.
const DEFAULT_MAX_CONNECTIONS: u32 = 50;

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        // An in-memory database is private to the connection that opened
        // it, so a pool of several would each see an empty schema. Tests
        // and any other `:memory:` caller get a single-connection pool.
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            DEFAULT_MAX_CONNECTIONS
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    // -----------------------------------------------------------------
    // data_encryption_keys
    // -----------------------------------------------------------------

    pub async fn active_dek(&self) -> Result<Option<DekRecord>, sqlx::Error> {
        with_retry(|| {
            sqlx::query_as::<_, DekRecord>(
                "SELECT id, wrapped_dek, iv, auth_tag, key_version, master_key_id, is_active, rotated_at, created_at
                 FROM data_encryption_keys WHERE is_active = 1 LIMIT 1",
            )
            .fetch_optional(&self.pool)
        })
        .await
    }

    /// Insert the first DEK record for a fresh database (no prior active
    /// row to deactivate).
    pub async fn insert_initial_dek(
        &self,
        wrapped_dek: &str,
        iv: &str,
        auth_tag: &str,
        master_key_id: &str,
    ) -> Result<DekRecord, sqlx::Error> {
        let now = Utc::now();
        let id = sqlx::query(
            "INSERT INTO data_encryption_keys
                (wrapped_dek, iv, auth_tag, key_version, master_key_id, is_active, rotated_at, created_at)
             VALUES (?1, ?2, ?3, 1, ?4, 1, NULL, ?5)",
        )
        .bind(wrapped_dek)
        .bind(iv)
        .bind(auth_tag)
        .bind(master_key_id)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.dek_by_id(id).await?.ok_or(sqlx::Error::RowNotFound)
    }

    /// Atomically deactivate the current active DEK and insert a new one
    /// as active, bumping `key_version`.
    pub async fn rotate_dek(
        &self,
        wrapped_dek: &str,
        iv: &str,
        auth_tag: &str,
        master_key_id: &str,
    ) -> Result<DekRecord, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let prev_version: i64 = sqlx::query(
            "SELECT key_version FROM data_encryption_keys WHERE is_active = 1 LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row.get(0))
        .unwrap_or(0);

        sqlx::query("UPDATE data_encryption_keys SET is_active = 0, rotated_at = ?1 WHERE is_active = 1")
            .bind(now)
            .execute(&mut *tx)
            .await?;

        let id = sqlx::query(
            "INSERT INTO data_encryption_keys
                (wrapped_dek, iv, auth_tag, key_version, master_key_id, is_active, rotated_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, NULL, ?6)",
        )
        .bind(wrapped_dek)
        .bind(iv)
        .bind(auth_tag)
        .bind(prev_version + 1)
        .bind(master_key_id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        tx.commit().await?;
        self.dek_by_id(id).await?.ok_or(sqlx::Error::RowNotFound)
    }

    /// Re-wrap the active DEK in place under a newly derived master key
    /// (`migrate_to_new_master`). The DEK value itself never changes —
    /// only its wrap and `master_key_id`.
    pub async fn rewrap_active_dek(
        &self,
        wrapped_dek: &str,
        iv: &str,
        auth_tag: &str,
        master_key_id: &str,
    ) -> Result<DekRecord, sqlx::Error> {
        let now = Utc::now();
        let id: i64 = sqlx::query(
            "SELECT id FROM data_encryption_keys WHERE is_active = 1 LIMIT 1",
        )
        .fetch_one(&self.pool)
        .await?
        .get(0);

        sqlx::query(
            "UPDATE data_encryption_keys
             SET wrapped_dek = ?1, iv = ?2, auth_tag = ?3, master_key_id = ?4, rotated_at = ?5
             WHERE id = ?6",
        )
        .bind(wrapped_dek)
        .bind(iv)
        .bind(auth_tag)
        .bind(master_key_id)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.dek_by_id(id).await?.ok_or(sqlx::Error::RowNotFound)
    }

    async fn dek_by_id(&self, id: i64) -> Result<Option<DekRecord>, sqlx::Error> {
        sqlx::query_as::<_, DekRecord>(
            "SELECT id, wrapped_dek, iv, auth_tag, key_version, master_key_id, is_active, rotated_at, created_at
             FROM data_encryption_keys WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    // -----------------------------------------------------------------
    // exchange_connections
    // -----------------------------------------------------------------

    pub async fn find_by_unique(
        &self,
        user_uid: &str,
        exchange: &str,
        label: &str,
    ) -> Result<Option<CredentialRecord>, sqlx::Error> {
        with_retry(|| {
            sqlx::query_as::<_, CredentialRecord>(
                "SELECT id, user_uid, exchange, label, encrypted_api_key, encrypted_api_secret,
                        encrypted_passphrase, credentials_hash, sync_interval_minutes, is_active,
                        created_at, updated_at
                 FROM exchange_connections WHERE user_uid = ?1 AND exchange = ?2 AND label = ?3",
            )
            .bind(user_uid)
            .bind(exchange)
            .bind(label)
            .fetch_optional(&self.pool)
        })
        .await
    }

    pub async fn find_by_hash(
        &self,
        user_uid: &str,
        credentials_hash: &str,
    ) -> Result<Option<CredentialRecord>, sqlx::Error> {
        sqlx::query_as::<_, CredentialRecord>(
            "SELECT id, user_uid, exchange, label, encrypted_api_key, encrypted_api_secret,
                    encrypted_passphrase, credentials_hash, sync_interval_minutes, is_active,
                    created_at, updated_at
             FROM exchange_connections WHERE user_uid = ?1 AND credentials_hash = ?2",
        )
        .bind(user_uid)
        .bind(credentials_hash)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn get_credential(&self, id: i64) -> Result<Option<CredentialRecord>, sqlx::Error> {
        with_retry(|| {
            sqlx::query_as::<_, CredentialRecord>(
                "SELECT id, user_uid, exchange, label, encrypted_api_key, encrypted_api_secret,
                        encrypted_passphrase, credentials_hash, sync_interval_minutes, is_active,
                        created_at, updated_at
                 FROM exchange_connections WHERE id = ?1",
            )
            .bind(id)
            .fetch_optional(&self.pool)
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_credential(
        &self,
        new: &NewCredential,
        encrypted_api_key: &str,
        encrypted_api_secret: &str,
        encrypted_passphrase: Option<&str>,
        credentials_hash: &str,
    ) -> Result<CredentialRecord, sqlx::Error> {
        let now = Utc::now();
        let id = sqlx::query(
            "INSERT INTO exchange_connections
                (user_uid, exchange, label, encrypted_api_key, encrypted_api_secret,
                 encrypted_passphrase, credentials_hash, sync_interval_minutes, is_active,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?9)",
        )
        .bind(&new.user_uid)
        .bind(&new.exchange)
        .bind(&new.label)
        .bind(encrypted_api_key)
        .bind(encrypted_api_secret)
        .bind(encrypted_passphrase)
        .bind(credentials_hash)
        .bind(new.sync_interval_minutes)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get_credential(id).await?.ok_or(sqlx::Error::RowNotFound)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn update_credential_fields(
        &self,
        id: i64,
        encrypted_api_key: &str,
        encrypted_api_secret: &str,
        encrypted_passphrase: Option<&str>,
        credentials_hash: &str,
        sync_interval_minutes: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE exchange_connections
             SET encrypted_api_key = ?1, encrypted_api_secret = ?2, encrypted_passphrase = ?3,
                 credentials_hash = ?4, sync_interval_minutes = ?5, updated_at = ?6
             WHERE id = ?7",
        )
        .bind(encrypted_api_key)
        .bind(encrypted_api_secret)
        .bind(encrypted_passphrase)
        .bind(credentials_hash)
        .bind(sync_interval_minutes)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_by_user(
        &self,
        user_uid: &str,
        active_only: bool,
    ) -> Result<Vec<CredentialRecord>, sqlx::Error> {
        if active_only {
            sqlx::query_as::<_, CredentialRecord>(
                "SELECT id, user_uid, exchange, label, encrypted_api_key, encrypted_api_secret,
                        encrypted_passphrase, credentials_hash, sync_interval_minutes, is_active,
                        created_at, updated_at
                 FROM exchange_connections WHERE user_uid = ?1 AND is_active = 1
                 ORDER BY created_at ASC",
            )
            .bind(user_uid)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, CredentialRecord>(
                "SELECT id, user_uid, exchange, label, encrypted_api_key, encrypted_api_secret,
                        encrypted_passphrase, credentials_hash, sync_interval_minutes, is_active,
                        created_at, updated_at
                 FROM exchange_connections WHERE user_uid = ?1
                 ORDER BY created_at ASC",
            )
            .bind(user_uid)
            .fetch_all(&self.pool)
            .await
        }
    }

    pub async fn list_active_users(&self) -> Result<Vec<String>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT DISTINCT user_uid FROM exchange_connections WHERE is_active = 1",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get(0)).collect())
    }

    pub async fn deactivate_credential(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE exchange_connections SET is_active = 0, updated_at = ?1 WHERE id = ?2")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_credential(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM exchange_connections WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count_active_for_user(&self, user_uid: &str) -> Result<i64, sqlx::Error> {
        let row = sqlx::query(
            "SELECT COUNT(*) FROM exchange_connections WHERE user_uid = ?1 AND is_active = 1",
        )
        .bind(user_uid)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get(0))
    }

    pub async fn count_active_total(&self) -> Result<i64, sqlx::Error> {
        let row = sqlx::query("SELECT COUNT(*) FROM exchange_connections WHERE is_active = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get(0))
    }

    // -----------------------------------------------------------------
    // snapshot_data
    // -----------------------------------------------------------------

    /// Persist every snapshot in `batch` within a single transaction — the
    /// per-user all-or-nothing write the scheduler requires. An empty batch
    /// is a no-op (the caller never calls this when `failed_records` is
    /// non-empty).
    /// Retried as a whole on a transient failure: every row is an upsert
    /// keyed on the snapshot's own uniqueness constraint, so re-running
    /// the entire transaction after a dropped connection is idempotent
    /// rather than double-writing.
    pub async fn insert_snapshots_atomic(
        &self,
        batch: &[NewSnapshot],
    ) -> Result<usize, sqlx::Error> {
        if batch.is_empty() {
            return Ok(0);
        }
        with_retry(|| self.insert_snapshots_atomic_once(batch)).await?;
        Ok(batch.len())
    }

    async fn insert_snapshots_atomic_once(&self, batch: &[NewSnapshot]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for snap in batch {
            let breakdown_json = serde_json::to_string(&snap.breakdown_by_market)
                .unwrap_or_else(|_| "[]".to_string());
            sqlx::query(
                "INSERT INTO snapshot_data
                    (user_uid, exchange, label, timestamp, total_equity, realized_balance,
                     unrealized_pnl, deposits, withdrawals, breakdown_by_market)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(user_uid, timestamp, exchange, label) DO UPDATE SET
                    total_equity = excluded.total_equity,
                    realized_balance = excluded.realized_balance,
                    unrealized_pnl = excluded.unrealized_pnl,
                    deposits = excluded.deposits,
                    withdrawals = excluded.withdrawals,
                    breakdown_by_market = excluded.breakdown_by_market",
            )
            .bind(&snap.user_uid)
            .bind(&snap.exchange)
            .bind(&snap.label)
            .bind(snap.timestamp)
            .bind(snap.total_equity)
            .bind(snap.realized_balance)
            .bind(snap.unrealized_pnl)
            .bind(snap.deposits)
            .bind(snap.withdrawals)
            .bind(breakdown_json)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    pub async fn snapshots_for_user(
        &self,
        user_uid: &str,
    ) -> Result<Vec<SnapshotRecord>, sqlx::Error> {
        sqlx::query_as::<_, SnapshotRecord>(
            "SELECT id, user_uid, exchange, label, timestamp, total_equity, realized_balance,
                    unrealized_pnl, deposits, withdrawals, breakdown_by_market
             FROM snapshot_data WHERE user_uid = ?1 ORDER BY timestamp ASC",
        )
        .bind(user_uid)
        .fetch_all(&self.pool)
        .await
    }

    // -----------------------------------------------------------------
    // sync_status
    // -----------------------------------------------------------------

    pub async fn record_sync_start(&self, triggered_by: &str) -> Result<i64, sqlx::Error> {
        let id = sqlx::query(
            "INSERT INTO sync_status (started_at, finished_at, duration_ms, snapshots_saved,
                users_aborted, skipped_overlap, triggered_by)
             VALUES (?1, NULL, NULL, 0, 0, 0, ?2)",
        )
        .bind(Utc::now())
        .bind(triggered_by)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn record_sync_skipped(&self, triggered_by: &str) -> Result<(), sqlx::Error> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO sync_status (started_at, finished_at, duration_ms, snapshots_saved,
                users_aborted, skipped_overlap, triggered_by)
             VALUES (?1, ?1, 0, 0, 0, 1, ?2)",
        )
        .bind(now)
        .bind(triggered_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_sync_finish(
        &self,
        id: i64,
        duration_ms: i64,
        snapshots_saved: i64,
        users_aborted: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE sync_status
             SET finished_at = ?1, duration_ms = ?2, snapshots_saved = ?3, users_aborted = ?4
             WHERE id = ?5",
        )
        .bind(Utc::now())
        .bind(duration_ms)
        .bind(snapshots_saved)
        .bind(users_aborted)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn last_sync_status(&self) -> Result<Option<SyncStatusRecord>, sqlx::Error> {
        sqlx::query_as::<_, SyncStatusRecord>(
            "SELECT id, started_at, finished_at, duration_ms, snapshots_saved, users_aborted,
                    skipped_overlap, triggered_by
             FROM sync_status ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
    }
}
