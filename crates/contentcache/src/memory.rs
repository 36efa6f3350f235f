use contentcache_core::CacheEntry;
use lru::LruCache;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};

/// Bounded in-memory tier: insertion-order LRU over canonical paths plus a
/// byte-size accumulator. The lock is held only across O(1) map operations.
///
/// Evictions are never written back; the metadata store already holds every
/// admitted entry.
pub struct MemoryCache {
    inner: Mutex<Inner>,
    budget_bytes: usize,
}

struct Inner {
    entries: LruCache<PathBuf, CacheEntry>,
    current_bytes: usize,
}

impl MemoryCache {
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                current_bytes: 0,
            }),
            budget_bytes,
        }
    }

    /// Look up an entry, promoting it to most-recently-used and bumping its
    /// access metadata.
    pub fn lookup(&self, path: &Path) -> Option<CacheEntry> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(path)?;
        entry.touch();
        Some(entry.clone())
    }

    /// Admit an entry at the most-recently-used position, evicting from the
    /// LRU end until the byte budget holds. Entries larger than the whole
    /// budget are not admitted. Returns the number of evictions.
    pub fn admit(&self, entry: CacheEntry) -> usize {
        let size = entry.estimated_size();
        if size > self.budget_bytes {
            return 0;
        }

        let mut inner = self.inner.lock();
        if let Some(previous) = inner.entries.pop(&entry.path) {
            inner.current_bytes = inner.current_bytes.saturating_sub(previous.estimated_size());
        }

        let mut evicted = 0;
        while inner.current_bytes + size > self.budget_bytes {
            match inner.entries.pop_lru() {
                Some((_, old)) => {
                    inner.current_bytes =
                        inner.current_bytes.saturating_sub(old.estimated_size());
                    evicted += 1;
                }
                None => break,
            }
        }

        inner.entries.put(entry.path.clone(), entry);
        inner.current_bytes += size;
        evicted
    }

    /// Remove one entry explicitly. Returns true if it was present.
    pub fn evict(&self, path: &Path) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.pop(path) {
            Some(entry) => {
                inner.current_bytes = inner.current_bytes.saturating_sub(entry.estimated_size());
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.current_bytes = 0;
    }

    pub fn current_bytes(&self) -> usize {
        self.inner.lock().current_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(path: &str, content: &str) -> CacheEntry {
        let now = Utc::now();
        CacheEntry {
            path: PathBuf::from(path),
            content_hash: "ab".repeat(32),
            mtime: 1.0,
            file_size: content.len() as u64,
            content: Some(content.to_string()),
            blob_ref: None,
            extracted_at: now,
            access_count: 0,
            last_accessed: now,
            created_at: now,
        }
    }

    #[test]
    fn lookup_bumps_access_metadata() {
        let cache = MemoryCache::new(1024 * 1024);
        cache.admit(entry("/tmp/a", "hello"));

        let first = cache.lookup(Path::new("/tmp/a")).unwrap();
        let second = cache.lookup(Path::new("/tmp/a")).unwrap();
        assert_eq!(first.access_count, 1);
        assert_eq!(second.access_count, 2);
        assert!(cache.lookup(Path::new("/tmp/unknown")).is_none());
    }

    #[test]
    fn eviction_keeps_total_within_budget() {
        let base = entry("/tmp/x", "").estimated_size();
        let budget = (base + 100) * 3;
        let cache = MemoryCache::new(budget);

        for i in 0..20 {
            cache.admit(entry(&format!("/tmp/f{i}"), &"c".repeat(100)));
            assert!(cache.current_bytes() <= budget);
        }
        assert!(cache.len() < 20);
    }

    #[test]
    fn least_recently_used_goes_first() {
        let base = entry("/tmp/x", "").estimated_size();
        let cache = MemoryCache::new((base + 10) * 2);

        cache.admit(entry("/tmp/a", "0123456789"));
        cache.admit(entry("/tmp/b", "0123456789"));
        cache.lookup(Path::new("/tmp/a"));
        cache.admit(entry("/tmp/c", "0123456789"));

        assert!(cache.lookup(Path::new("/tmp/a")).is_some());
        assert!(cache.lookup(Path::new("/tmp/b")).is_none());
        assert!(cache.lookup(Path::new("/tmp/c")).is_some());
    }

    #[test]
    fn oversized_entries_are_rejected() {
        let cache = MemoryCache::new(64);
        let evicted = cache.admit(entry("/tmp/big", &"x".repeat(1024)));
        assert_eq!(evicted, 0);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.current_bytes(), 0);
    }

    #[test]
    fn readmission_replaces_previous_size() {
        let cache = MemoryCache::new(1024 * 1024);
        cache.admit(entry("/tmp/a", &"x".repeat(100)));
        let after_first = cache.current_bytes();
        cache.admit(entry("/tmp/a", &"x".repeat(50)));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.current_bytes(), after_first - 50);
    }

    #[test]
    fn evict_adjusts_accounting() {
        let cache = MemoryCache::new(1024 * 1024);
        cache.admit(entry("/tmp/a", "hello"));
        assert!(cache.evict(Path::new("/tmp/a")));
        assert!(!cache.evict(Path::new("/tmp/a")));
        assert_eq!(cache.current_bytes(), 0);
    }
}
