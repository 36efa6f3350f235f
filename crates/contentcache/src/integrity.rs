use crate::fingerprint;
use contentcache_core::{CacheEntry, CacheError, IntegrityStatus, Result};
use futures::future::join_all;
use std::collections::HashMap;
use std::path::PathBuf;

/// Classifies a cached entry against the current state of its source file.
///
/// Checks run cheapest-first: existence, then size, then mtime, then (only
/// when enabled) a full content hash. Size is compared before mtime because
/// it is strictly more reliable against clock skew; an entry whose size
/// differs is `FileModified` even when the mtimes agree.
#[derive(Debug, Clone, Copy)]
pub struct IntegrityChecker {
    verify_hash: bool,
}

impl IntegrityChecker {
    pub fn new(verify_hash: bool) -> Self {
        Self { verify_hash }
    }

    pub async fn check(&self, entry: &CacheEntry) -> Result<IntegrityStatus> {
        let meta = match tokio::fs::metadata(&entry.path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(IntegrityStatus::FileMissing)
            }
            Err(e) => {
                return Err(CacheError::StorageFailure(format!(
                    "stat {}: {}",
                    entry.path.display(),
                    e
                )))
            }
        };
        if !meta.is_file() {
            return Ok(IntegrityStatus::FileMissing);
        }

        if meta.len() != entry.file_size {
            return Ok(IntegrityStatus::FileModified);
        }

        let mtime = meta
            .modified()
            .map(fingerprint::epoch_seconds)
            .unwrap_or(0.0);
        if mtime > entry.mtime {
            return Ok(IntegrityStatus::FileModified);
        }

        if self.verify_hash {
            let current = fingerprint::hash_file(&entry.path).await?;
            if current != entry.content_hash {
                return Ok(IntegrityStatus::ContentChanged);
            }
        }

        Ok(IntegrityStatus::Valid)
    }

    /// Check many entries concurrently.
    pub async fn check_batch(
        &self,
        entries: &[CacheEntry],
    ) -> Result<HashMap<PathBuf, IntegrityStatus>> {
        let statuses = join_all(entries.iter().map(|entry| self.check(entry))).await;
        let mut results = HashMap::with_capacity(entries.len());
        for (entry, status) in entries.iter().zip(statuses) {
            results.insert(entry.path.clone(), status?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::Path;
    use tempfile::TempDir;

    async fn entry_for(path: &Path) -> CacheEntry {
        let snap = fingerprint::snapshot_file(path).await.unwrap();
        let now = Utc::now();
        CacheEntry {
            path: path.to_path_buf(),
            content_hash: snap.content_hash,
            mtime: snap.mtime,
            file_size: snap.file_size,
            content: None,
            blob_ref: None,
            extracted_at: now,
            access_count: 0,
            last_accessed: now,
            created_at: now,
        }
    }

    #[tokio::test]
    async fn unchanged_file_is_valid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let entry = entry_for(&path).await;
        let checker = IntegrityChecker::new(true);
        assert_eq!(checker.check(&entry).await.unwrap(), IntegrityStatus::Valid);
    }

    #[tokio::test]
    async fn deleted_file_is_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();
        let entry = entry_for(&path).await;
        tokio::fs::remove_file(&path).await.unwrap();

        let checker = IntegrityChecker::new(true);
        assert_eq!(
            checker.check(&entry).await.unwrap(),
            IntegrityStatus::FileMissing
        );
    }

    #[tokio::test]
    async fn size_change_is_modified_before_any_hashing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();
        let entry = entry_for(&path).await;
        tokio::fs::write(&path, b"hello world").await.unwrap();

        // verify_hash disabled: the size check alone must catch it.
        let checker = IntegrityChecker::new(false);
        assert_eq!(
            checker.check(&entry).await.unwrap(),
            IntegrityStatus::FileModified
        );
    }

    #[tokio::test]
    async fn newer_mtime_is_modified() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();
        let mut entry = entry_for(&path).await;
        // Pretend the extraction happened well before the file's mtime.
        entry.mtime -= 10.0;

        let checker = IntegrityChecker::new(false);
        assert_eq!(
            checker.check(&entry).await.unwrap(),
            IntegrityStatus::FileModified
        );
    }

    #[tokio::test]
    async fn same_size_different_bytes_needs_hash_verification() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();
        let mut entry = entry_for(&path).await;
        tokio::fs::write(&path, b"jello").await.unwrap();
        // Hide the rewrite from the stat checks.
        let snap = fingerprint::snapshot_file(&path).await.unwrap();
        entry.mtime = snap.mtime;

        assert_eq!(
            IntegrityChecker::new(true).check(&entry).await.unwrap(),
            IntegrityStatus::ContentChanged
        );
        assert_eq!(
            IntegrityChecker::new(false).check(&entry).await.unwrap(),
            IntegrityStatus::Valid
        );
    }

    #[tokio::test]
    async fn batch_reports_per_path() {
        let dir = TempDir::new().unwrap();
        let live = dir.path().join("live.txt");
        let dead = dir.path().join("dead.txt");
        tokio::fs::write(&live, b"hello").await.unwrap();
        tokio::fs::write(&dead, b"hello").await.unwrap();
        let entries = vec![entry_for(&live).await, entry_for(&dead).await];
        tokio::fs::remove_file(&dead).await.unwrap();

        let statuses = IntegrityChecker::new(true)
            .check_batch(&entries)
            .await
            .unwrap();
        assert_eq!(statuses[&live], IntegrityStatus::Valid);
        assert_eq!(statuses[&dead], IntegrityStatus::FileMissing);
    }
}
