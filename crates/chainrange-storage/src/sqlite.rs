//! SQLite progress store.
//!
//! One row per entity in `import_progress`; the ranges are stored as JSON
//! text. Uses `sqlx` with WAL mode so several importer processes can share
//! one database file.
//!
//! # Usage
//! ```rust,no_run
//! use chainrange_storage::sqlite::SqliteProgressStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteProgressStore::<u64>::open("./progress.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteProgressStore::<u64>::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnection, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use chainrange_core::error::ImportError;
use chainrange_core::progress::{ImportProgress, ProgressStore};
use chainrange_core::range::{Range, RangeValue};

fn storage_err(e: impl std::fmt::Display) -> ImportError {
    ImportError::Storage(e.to_string())
}

/// SQLite-backed [`ProgressStore`].
pub struct SqliteProgressStore<T> {
    pool: SqlitePool,
    _value: PhantomData<fn() -> T>,
}

impl<T> SqliteProgressStore<T>
where
    T: RangeValue + Serialize + DeserializeOwned,
{
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./progress.db"`) or a full
    /// SQLite URL (`"sqlite:./progress.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, ImportError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;
        Self::with_pool(pool).await
    }

    /// Open an in-memory database, lost when the store is dropped.
    pub async fn in_memory() -> Result<Self, ImportError> {
        // every connection to :memory: is a separate database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, ImportError> {
        let store = Self {
            pool,
            _value: PhantomData,
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), ImportError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS import_progress (
                entity_key     TEXT    PRIMARY KEY,
                full_range     TEXT    NOT NULL,
                covered_ranges TEXT    NOT NULL,
                to_retry       TEXT    NOT NULL,
                updated_at     INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    /// Keys of every stored entity, sorted.
    pub async fn keys(&self) -> Result<Vec<String>, ImportError> {
        let rows = sqlx::query("SELECT entity_key FROM import_progress ORDER BY entity_key")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(rows.iter().map(|r| r.get("entity_key")).collect())
    }

    async fn load_with(conn: &mut SqliteConnection, key: &str) -> Result<Option<ImportProgress<T>>, ImportError> {
        let row = sqlx::query(
            "SELECT full_range, covered_ranges, to_retry
             FROM import_progress WHERE entity_key = ?",
        )
        .bind(key)
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let full_range: Range<T> = decode(&row.get::<String, _>("full_range"))?;
        let mut progress = ImportProgress {
            full_range,
            covered_ranges: decode(&row.get::<String, _>("covered_ranges"))?,
            to_retry: decode(&row.get::<String, _>("to_retry"))?,
        };
        progress.normalize();
        Ok(Some(progress))
    }

    async fn save_with(conn: &mut SqliteConnection, key: &str, progress: &ImportProgress<T>) -> Result<(), ImportError> {
        sqlx::query(
            "INSERT OR REPLACE INTO import_progress
             (entity_key, full_range, covered_ranges, to_retry, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(key)
        .bind(encode(&progress.full_range)?)
        .bind(encode(&progress.covered_ranges)?)
        .bind(encode(&progress.to_retry)?)
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *conn)
        .await
        .map_err(storage_err)?;

        debug!(
            entity = key,
            covered = progress.covered_ranges.len(),
            to_retry = progress.to_retry.len(),
            "import progress saved"
        );
        Ok(())
    }
}

fn encode<V: Serialize>(value: &V) -> Result<String, ImportError> {
    serde_json::to_string(value).map_err(storage_err)
}

fn decode<V: DeserializeOwned>(text: &str) -> Result<V, ImportError> {
    serde_json::from_str(text).map_err(storage_err)
}

// ─── ProgressStore impl ──────────────────────────────────────────────────────

#[async_trait]
impl<T> ProgressStore<T> for SqliteProgressStore<T>
where
    T: RangeValue + Serialize + DeserializeOwned,
{
    async fn load(&self, key: &str) -> Result<Option<ImportProgress<T>>, ImportError> {
        let mut conn = self.pool.acquire().await.map_err(storage_err)?;
        Self::load_with(&mut conn, key).await
    }

    async fn save(&self, key: &str, progress: &ImportProgress<T>) -> Result<(), ImportError> {
        let mut conn = self.pool.acquire().await.map_err(storage_err)?;
        Self::save_with(&mut conn, key, progress).await
    }

    async fn delete(&self, key: &str) -> Result<(), ImportError> {
        sqlx::query("DELETE FROM import_progress WHERE entity_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Read-modify-write inside one transaction. The write lock is taken
    /// before reading, so concurrent writers to the same file serialize.
    /// Dropping the future mid-way rolls the transaction back.
    async fn record(
        &self,
        key: &str,
        full_range: Range<T>,
        succeeded: &[Range<T>],
        failed: &[Range<T>],
    ) -> Result<ImportProgress<T>, ImportError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        sqlx::query("UPDATE import_progress SET updated_at = updated_at WHERE entity_key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;

        let mut progress = Self::load_with(&mut tx, key)
            .await?
            .unwrap_or_else(|| ImportProgress::new(full_range));
        progress.extend_to(full_range.to());
        progress.record_success(succeeded);
        progress.record_failure(failed);
        Self::save_with(&mut tx, key, &progress).await?;

        tx.commit()
            .await
            .map_err(|e| ImportError::Storage(format!("commit progress of '{key}': {e}")))?;
        Ok(progress)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
