use async_trait::async_trait;
use chrono::{DateTime, Utc};
use contentcache_core::{CacheEntry, CacheError, MetadataStore, Result, StoreTotals};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Embedded relational metadata backend: one `entries` table keyed by path
/// with secondary indexes on `content_hash` and `last_accessed`, plus a small
/// key-value table for counters.
///
/// A bounded connection pool serializes writers while WAL mode lets reads
/// proceed in parallel.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if missing) the database at `path` with a pool of at
    /// most `pool_size` connections.
    pub async fn connect(path: &Path, pool_size: u32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let options = Self::base_options().filename(path).create_if_missing(true);
        let storage = Self::new(options, pool_size).await?;
        info!(path = %path.display(), pool_size, "opened metadata store");
        Ok(storage)
    }

    /// In-memory database for tests. Limited to a single connection so every
    /// query sees the same data.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = Self::base_options().filename(":memory:");
        Self::new(options, 1).await
    }

    async fn new(options: SqliteConnectOptions, pool_size: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size)
            .connect_with(options)
            .await
            .map_err(|e| db_err("open database", e))?;
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    fn base_options() -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(1500))
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS entries (
                path TEXT PRIMARY KEY,
                content_hash TEXT NOT NULL,
                mtime REAL NOT NULL,
                file_size INTEGER NOT NULL,
                content TEXT,
                blob_ref TEXT,
                extracted_at TEXT NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 0,
                last_accessed TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("create entries table", e))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_content_hash ON entries(content_hash)")
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("create hash index", e))?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_last_accessed ON entries(last_accessed)")
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("create access index", e))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS meta_kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("create meta_kv table", e))?;
        sqlx::query(
            "INSERT INTO meta_kv (key, value, updated_at) VALUES ('schema_version', '1', ?1)
             ON CONFLICT(key) DO NOTHING",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("record schema version", e))?;

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStorage {
    async fn get_by_path(&self, path: &Path) -> Result<Option<CacheEntry>> {
        let row = sqlx::query("SELECT * FROM entries WHERE path = ?1")
            .bind(path_key(path))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("lookup by path", e))?;
        row.map(|r| row_to_entry(&r)).transpose()
    }

    async fn get_by_hash(&self, content_hash: &str) -> Result<Vec<CacheEntry>> {
        let rows = sqlx::query("SELECT * FROM entries WHERE content_hash = ?1 ORDER BY path")
            .bind(content_hash)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("lookup by hash", e))?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn put(&self, entry: &CacheEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO entries (
                path, content_hash, mtime, file_size, content, blob_ref,
                extracted_at, access_count, last_accessed, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(path) DO UPDATE SET
                content_hash = excluded.content_hash,
                mtime = excluded.mtime,
                file_size = excluded.file_size,
                content = excluded.content,
                blob_ref = excluded.blob_ref,
                extracted_at = excluded.extracted_at,
                last_accessed = excluded.last_accessed",
        )
        .bind(path_key(&entry.path))
        .bind(&entry.content_hash)
        .bind(entry.mtime)
        .bind(entry.file_size as i64)
        .bind(entry.content.as_deref())
        .bind(entry.blob_ref.as_deref())
        .bind(entry.extracted_at)
        .bind(entry.access_count as i64)
        .bind(entry.last_accessed)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("upsert entry", e))?;
        Ok(())
    }

    async fn delete_by_path(&self, path: &Path) -> Result<bool> {
        let result = sqlx::query("DELETE FROM entries WHERE path = ?1")
            .bind(path_key(path))
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("delete entry", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn touch(
        &self,
        path: &Path,
        last_accessed: DateTime<Utc>,
        access_count: u64,
    ) -> Result<()> {
        sqlx::query("UPDATE entries SET last_accessed = ?1, access_count = ?2 WHERE path = ?3")
            .bind(last_accessed)
            .bind(access_count as i64)
            .bind(path_key(path))
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("touch entry", e))?;
        Ok(())
    }

    async fn older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<CacheEntry>> {
        let rows = sqlx::query("SELECT * FROM entries WHERE last_accessed < ?1 ORDER BY path")
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("scan old entries", e))?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn count_by_hash(&self) -> Result<HashMap<String, u64>> {
        let rows =
            sqlx::query("SELECT content_hash, COUNT(*) AS refs FROM entries GROUP BY content_hash")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| db_err("count by hash", e))?;
        let mut counts = HashMap::with_capacity(rows.len());
        for row in rows {
            let hash: String = row.try_get("content_hash").map_err(|e| db_err("read row", e))?;
            let refs: i64 = row.try_get("refs").map_err(|e| db_err("read row", e))?;
            counts.insert(hash, refs as u64);
        }
        Ok(counts)
    }

    async fn totals(&self) -> Result<StoreTotals> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS entry_count, COALESCE(SUM(file_size), 0) AS total_bytes
             FROM entries",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_err("read totals", e))?;
        let entry_count: i64 = row.try_get("entry_count").map_err(|e| db_err("read row", e))?;
        let total_bytes: i64 = row.try_get("total_bytes").map_err(|e| db_err("read row", e))?;
        Ok(StoreTotals {
            entry_count: entry_count as u64,
            total_bytes: total_bytes as u64,
        })
    }

    async fn close(&self) -> Result<()> {
        // Let SQLite refresh query-planner statistics before shutdown.
        let _ = sqlx::query("PRAGMA optimize").execute(&self.pool).await;
        self.pool.close().await;
        Ok(())
    }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn row_to_entry(row: &SqliteRow) -> Result<CacheEntry> {
    let read = |e: sqlx::Error| db_err("read row", e);
    Ok(CacheEntry {
        path: PathBuf::from(row.try_get::<String, _>("path").map_err(read)?),
        content_hash: row.try_get("content_hash").map_err(read)?,
        mtime: row.try_get("mtime").map_err(read)?,
        file_size: row.try_get::<i64, _>("file_size").map_err(read)? as u64,
        content: row.try_get("content").map_err(read)?,
        blob_ref: row.try_get("blob_ref").map_err(read)?,
        extracted_at: row.try_get("extracted_at").map_err(read)?,
        access_count: row.try_get::<i64, _>("access_count").map_err(read)? as u64,
        last_accessed: row.try_get("last_accessed").map_err(read)?,
        created_at: row.try_get("created_at").map_err(read)?,
    })
}

fn db_err(op: &str, err: sqlx::Error) -> CacheError {
    CacheError::StorageFailure(format!("{op}: {err}"))
}
