use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Outcome of checking a cached entry against the file it was extracted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityStatus {
    /// The source file is unchanged; the entry may be served.
    Valid,
    /// The source file no longer exists.
    FileMissing,
    /// Size or modification time differ from the recorded values.
    FileModified,
    /// Metadata matched but the recomputed content hash did not.
    ContentChanged,
}

/// One cached extraction, keyed by canonical source path.
///
/// `content` and `blob_ref` are mutually exclusive in durable storage: small
/// extractions are inlined, large ones live in the blob store addressed by
/// `content_hash`. The memory tier always carries the materialized content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Canonical, symlink-resolved absolute path of the source file.
    pub path: PathBuf,
    /// Lowercase hex SHA-256 of the source file bytes at extraction time.
    pub content_hash: String,
    /// Source file modification time, seconds since epoch with sub-second
    /// precision preserved.
    pub mtime: f64,
    /// Source file size in bytes at extraction time.
    pub file_size: u64,
    /// Extracted content when stored inline.
    pub content: Option<String>,
    /// Blob-store reference (the content hash) when stored out of line.
    pub blob_ref: Option<String>,
    pub extracted_at: DateTime<Utc>,
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Approximate memory footprint: the inline content dominates; entries
    /// held by reference only count their record overhead.
    pub fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.path.as_os_str().len()
            + self.content_hash.len()
            + self.content.as_ref().map_or(0, |c| c.len())
            + self.blob_ref.as_ref().map_or(0, |r| r.len())
    }

    /// Record a hit: bump the access counter and refresh the access time.
    pub fn touch(&mut self) {
        self.access_count += 1;
        self.last_accessed = Utc::now();
    }
}

/// Result surfaced to callers of `get`; derivative of a [`CacheEntry`] and
/// never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct CachedContent {
    pub content: String,
    pub from_cache: bool,
    pub content_hash: String,
    pub extracted_at: DateTime<Utc>,
    pub file_size: u64,
}

/// Aggregate counts a metadata backend reports for statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreTotals {
    pub entry_count: u64,
    pub total_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(content: Option<&str>) -> CacheEntry {
        let now = Utc::now();
        CacheEntry {
            path: PathBuf::from("/tmp/a.txt"),
            content_hash: "ab".repeat(32),
            mtime: 1_700_000_000.25,
            file_size: 5,
            content: content.map(str::to_string),
            blob_ref: None,
            extracted_at: now,
            access_count: 0,
            last_accessed: now,
            created_at: now,
        }
    }

    #[test]
    fn inline_content_dominates_size() {
        let small = entry(None).estimated_size();
        let big = entry(Some("x")).estimated_size();
        assert_eq!(big - small, 1);
    }

    #[test]
    fn touch_updates_access_metadata() {
        let mut e = entry(Some("hello"));
        let before = e.last_accessed;
        e.touch();
        assert_eq!(e.access_count, 1);
        assert!(e.last_accessed >= before);
    }

    #[test]
    fn entry_roundtrips_through_json() {
        let e = entry(Some("hello"));
        let json = serde_json::to_string(&e).unwrap();
        let back: CacheEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.path, e.path);
        assert_eq!(back.mtime, e.mtime);
        assert_eq!(back.content.as_deref(), Some("hello"));
    }
}
