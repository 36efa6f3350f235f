use crate::error::Result;
use crate::types::{CacheEntry, StoreTotals};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};

/// Durable mapping from canonical path to cache entry.
///
/// The coordinator depends only on this capability set; backends must be safe
/// under concurrent access from multiple workers within one process. When an
/// instance is shared across processes, consistency is last-writer-wins per
/// key.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Primary lookup by canonical path.
    async fn get_by_path(&self, path: &Path) -> Result<Option<CacheEntry>>;

    /// All entries sharing a content hash, ordered by path.
    async fn get_by_hash(&self, content_hash: &str) -> Result<Vec<CacheEntry>>;

    /// Upsert by path, last-writer-wins. Updating an existing entry preserves
    /// its accumulated access count.
    async fn put(&self, entry: &CacheEntry) -> Result<()>;

    /// Returns true if an entry was removed.
    async fn delete_by_path(&self, path: &Path) -> Result<bool>;

    /// Cheap update of access metadata after a hit.
    async fn touch(
        &self,
        path: &Path,
        last_accessed: DateTime<Utc>,
        access_count: u64,
    ) -> Result<()>;

    /// Sweep candidates: every entry last accessed before the cutoff.
    async fn older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<CacheEntry>>;

    /// Reference counts per content hash, for blob GC and dedupe statistics.
    async fn count_by_hash(&self) -> Result<HashMap<String, u64>>;

    /// Aggregate entry count and summed source-file bytes.
    async fn totals(&self) -> Result<StoreTotals>;

    /// Release pooled connections. Safe to call more than once.
    async fn close(&self) -> Result<()>;
}

/// User-supplied extraction function, invoked only on cache misses.
///
/// Opaque to the cache: its identity is not part of the cache key, so two
/// callers passing different processors for the same path observe the same
/// cached content.
#[async_trait]
pub trait ContentProcessor: Send + Sync {
    async fn process(&self, path: &Path) -> Result<String>;
}

#[async_trait]
impl<F, Fut> ContentProcessor for F
where
    F: Fn(PathBuf) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String>> + Send,
{
    async fn process(&self, path: &Path) -> Result<String> {
        (self)(path.to_path_buf()).await
    }
}
