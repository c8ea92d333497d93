//! SQLite implementation of the store port.
//!
//! Records live in a `kv` table carrying the optimistic-locking version and
//! a sliding expiry; advisory locks are leases in `kv_locks`. Expired rows
//! are treated as absent and reaped when touched.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::adapters::sqlite::migrations;
use crate::domain::ports::store::{
    apply_field_ops, FieldOp, LockToken, Store, StoreError, StoreResult, Versioned,
};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) a database file and apply the schema.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| StoreError::Invalid(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;

        migrations::run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn transient(e: sqlx::Error) -> StoreError {
    StoreError::Transient(e.to_string())
}

fn expiry_from(ttl_seconds: Option<i64>) -> Option<String> {
    ttl_seconds.map(|secs| (Utc::now() + chrono::Duration::seconds(secs)).to_rfc3339())
}

fn is_expired(expires_at: Option<&str>) -> bool {
    expires_at
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .is_some_and(|at| at.with_timezone(&Utc) <= Utc::now())
}

#[async_trait]
impl Store for SqliteStore {
    async fn load(&self, key: &str) -> StoreResult<Versioned> {
        let row = sqlx::query("SELECT value, version, expires_at FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(transient)?;

        let Some(row) = row else {
            return Err(StoreError::NotFound(key.to_string()));
        };
        let expires_at: Option<String> = row.get("expires_at");
        if is_expired(expires_at.as_deref()) {
            sqlx::query("DELETE FROM kv WHERE key = ?")
                .bind(key)
                .execute(&self.pool)
                .await
                .map_err(transient)?;
            return Err(StoreError::NotFound(key.to_string()));
        }

        let raw: String = row.get("value");
        let version: i64 = row.get("version");
        let value: Value =
            serde_json::from_str(&raw).map_err(|e| StoreError::Invalid(e.to_string()))?;
        Ok(Versioned {
            value,
            version: u64::try_from(version).unwrap_or(0),
        })
    }

    async fn save(&self, key: &str, value: Value, ttl: Option<Duration>) -> StoreResult<u64> {
        let ttl_seconds = ttl.map(|t| i64::try_from(t.as_secs()).unwrap_or(i64::MAX));
        let raw = value.to_string();

        let mut tx = self.pool.begin().await.map_err(transient)?;
        let row = sqlx::query("SELECT version, expires_at FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(transient)?;
        let version = match row {
            Some(row) => {
                let expires_at: Option<String> = row.get("expires_at");
                if is_expired(expires_at.as_deref()) {
                    1
                } else {
                    row.get::<i64, _>("version") + 1
                }
            }
            None => 1,
        };

        sqlx::query(
            r"INSERT INTO kv (key, value, version, ttl_seconds, expires_at)
              VALUES (?, ?, ?, ?, ?)
              ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                version = excluded.version,
                ttl_seconds = excluded.ttl_seconds,
                expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(&raw)
        .bind(version)
        .bind(ttl_seconds)
        .bind(expiry_from(ttl_seconds))
        .execute(&mut *tx)
        .await
        .map_err(transient)?;
        tx.commit().await.map_err(transient)?;

        Ok(u64::try_from(version).unwrap_or(0))
    }

    async fn compare_and_save(
        &self,
        key: &str,
        expected_version: u64,
        value: Value,
    ) -> StoreResult<u64> {
        let expected = i64::try_from(expected_version).unwrap_or(i64::MAX);

        let mut tx = self.pool.begin().await.map_err(transient)?;
        let row = sqlx::query("SELECT version, ttl_seconds, expires_at FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(transient)?;
        let Some(row) = row else {
            return Err(StoreError::NotFound(key.to_string()));
        };
        let expires_at: Option<String> = row.get("expires_at");
        if is_expired(expires_at.as_deref()) {
            return Err(StoreError::NotFound(key.to_string()));
        }
        if row.get::<i64, _>("version") != expected {
            return Err(StoreError::Conflict(key.to_string()));
        }
        let ttl_seconds: Option<i64> = row.get("ttl_seconds");

        sqlx::query("UPDATE kv SET value = ?, version = ?, expires_at = ? WHERE key = ?")
            .bind(value.to_string())
            .bind(expected + 1)
            .bind(expiry_from(ttl_seconds))
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(transient)?;
        tx.commit().await.map_err(transient)?;

        Ok(expected_version + 1)
    }

    async fn apply(&self, key: &str, ops: Vec<FieldOp>) -> StoreResult<Vec<Value>> {
        let mut tx = self.pool.begin().await.map_err(transient)?;
        let row = sqlx::query("SELECT value, version, ttl_seconds, expires_at FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(transient)?;

        let Some(row) = row else {
            return Err(StoreError::NotFound(key.to_string()));
        };
        let expires_at: Option<String> = row.get("expires_at");
        if is_expired(expires_at.as_deref()) {
            return Err(StoreError::NotFound(key.to_string()));
        }

        let raw: String = row.get("value");
        let version: i64 = row.get("version");
        let ttl_seconds: Option<i64> = row.get("ttl_seconds");
        let mut value: Value =
            serde_json::from_str(&raw).map_err(|e| StoreError::Invalid(e.to_string()))?;

        let results = apply_field_ops(&mut value, &ops)?;

        sqlx::query("UPDATE kv SET value = ?, version = ?, expires_at = ? WHERE key = ?")
            .bind(value.to_string())
            .bind(version + 1)
            .bind(expiry_from(ttl_seconds))
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(transient)?;
        tx.commit().await.map_err(transient)?;

        Ok(results)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let existed = self.try_load(key).await?.is_some();
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(transient)?;
        Ok(existed)
    }

    async fn try_lock(&self, key: &str, lease: Duration) -> StoreResult<Option<LockToken>> {
        let mut tx = self.pool.begin().await.map_err(transient)?;
        let row = sqlx::query("SELECT expires_at FROM kv_locks WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(transient)?;
        if let Some(row) = row {
            let expires_at: String = row.get("expires_at");
            if !is_expired(Some(&expires_at)) {
                return Ok(None);
            }
        }

        let token = Uuid::new_v4().to_string();
        let expires_at =
            (Utc::now() + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::zero()))
                .to_rfc3339();
        sqlx::query(
            r"INSERT INTO kv_locks (key, token, expires_at) VALUES (?, ?, ?)
              ON CONFLICT(key) DO UPDATE SET token = excluded.token, expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(&token)
        .bind(expires_at)
        .execute(&mut *tx)
        .await
        .map_err(transient)?;
        tx.commit().await.map_err(transient)?;

        Ok(Some(token))
    }

    async fn unlock(&self, key: &str, token: &LockToken) -> StoreResult<()> {
        sqlx::query("DELETE FROM kv_locks WHERE key = ? AND token = ?")
            .bind(key)
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(transient)?;
        Ok(())
    }

    async fn live_keys(&self) -> StoreResult<Vec<String>> {
        let rows = sqlx::query("SELECT key, expires_at FROM kv")
            .fetch_all(&self.pool)
            .await
            .map_err(transient)?;
        Ok(rows
            .into_iter()
            .filter(|row| {
                let expires_at: Option<String> = row.get("expires_at");
                !is_expired(expires_at.as_deref())
            })
            .map(|row| row.get("key"))
            .collect())
    }
}
