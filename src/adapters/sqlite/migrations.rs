//! Embedded schema for the sqlite-backed store.

use sqlx::SqlitePool;

use crate::domain::ports::store::{StoreError, StoreResult};

const SCHEMA: &[&str] = &[
    r"CREATE TABLE IF NOT EXISTS kv (
        key         TEXT PRIMARY KEY,
        value       TEXT NOT NULL,
        version     INTEGER NOT NULL,
        ttl_seconds INTEGER,
        expires_at  TEXT
    )",
    r"CREATE TABLE IF NOT EXISTS kv_locks (
        key        TEXT PRIMARY KEY,
        token      TEXT NOT NULL,
        expires_at TEXT NOT NULL
    )",
    r"CREATE INDEX IF NOT EXISTS idx_kv_expires_at ON kv (expires_at)",
];

/// Apply the embedded schema. Idempotent.
pub async fn run(pool: &SqlitePool) -> StoreResult<()> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
    }
    Ok(())
}
