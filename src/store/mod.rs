//! Durable persistence for all engine entities.
//!
//! A pooled SQLite store (10–20 connections, WAL mode) with an attempt-
//! counted retry policy for recoverable failures and an in-process
//! per-project lock that serializes session creation and id allocation.
//! SQLite has no row-level `FOR UPDATE`, so the lock plus short transactions
//! provide the at-most-one-running-session guarantee.

mod backlog;
pub mod models;
mod projects;
mod quality;
pub mod retry;
mod schema;
mod sessions;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Row, Sqlite, Transaction};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::errors::{YokeError, YokeResult};
use retry::RetryPolicy;

pub use models::*;

/// Handle to the relational store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    retry: RetryPolicy,
    locks: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

/// Guard serializing session creation and backlog id allocation per project.
pub type ProjectLockGuard = OwnedMutexGuard<()>;

impl Store {
    /// Open (or create) the database at `url` and apply the schema.
    pub async fn connect(url: &str) -> YokeResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| YokeError::Validation(format!("invalid database URL: {e}")))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(10)
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            retry: RetryPolicy::default(),
            locks: Arc::new(Mutex::new(HashMap::new())),
        };
        store.init().await?;
        Ok(store)
    }

    /// In-memory database for tests.
    pub async fn in_memory() -> YokeResult<Self> {
        // A single connection keeps the in-memory database alive and shared.
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| YokeError::Internal(e.to_string()))?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self {
            pool,
            retry: RetryPolicy::default(),
            locks: Arc::new(Mutex::new(HashMap::new())),
        };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> YokeResult<()> {
        sqlx::raw_sql(schema::SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Serialize session creation and id allocation for one project.
    pub async fn acquire_project_lock(&self, project_id: Uuid) -> ProjectLockGuard {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(project_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub(crate) async fn begin(&self) -> YokeResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    pub(crate) fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }
}

// ── Row mapping helpers ───────────────────────────────────────────

pub(crate) fn bad_row(context: &str, detail: impl std::fmt::Display) -> YokeError {
    YokeError::Storage {
        message: format!("corrupt {context} row: {detail}"),
        recoverable: false,
    }
}

pub(crate) fn row_uuid(row: &SqliteRow, col: &str) -> YokeResult<Uuid> {
    let raw: String = row.try_get(col)?;
    Uuid::parse_str(&raw).map_err(|e| bad_row(col, e))
}

pub(crate) fn row_uuid_opt(row: &SqliteRow, col: &str) -> YokeResult<Option<Uuid>> {
    let raw: Option<String> = row.try_get(col)?;
    raw.map(|s| Uuid::parse_str(&s).map_err(|e| bad_row(col, e)))
        .transpose()
}

pub(crate) fn row_json<T: serde::de::DeserializeOwned>(
    row: &SqliteRow,
    col: &str,
) -> YokeResult<T> {
    let raw: String = row.try_get(col)?;
    serde_json::from_str(&raw).map_err(|e| bad_row(col, e))
}

pub(crate) fn row_json_opt<T: serde::de::DeserializeOwned>(
    row: &SqliteRow,
    col: &str,
) -> YokeResult<Option<T>> {
    let raw: Option<String> = row.try_get(col)?;
    raw.map(|s| serde_json::from_str(&s).map_err(|e| bad_row(col, e)))
        .transpose()
}
