use crate::blob::BlobStore;
use crate::filter::NegativeFilter;
use crate::fingerprint;
use crate::integrity::IntegrityChecker;
use crate::locks::PathLocks;
use crate::memory::MemoryCache;
use crate::metrics::{CacheStatistics, MetricsRecorder};
use crate::sqlite_store::SqliteStorage;
use crate::validate::PathValidator;
use chrono::Utc;
use contentcache_core::{
    CacheConfig, CacheEntry, CacheError, CachedContent, ContentProcessor, IntegrityStatus,
    MetadataStore, Result,
};
use futures::future::join_all;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, info, warn};

/// Content above this size is stored in the blob store instead of inline in
/// the metadata record.
pub const INLINE_THRESHOLD: usize = 64 * 1024;

/// Multi-tier content cache keyed by the identity and current state of files
/// on disk.
///
/// Lookups cascade memory tier → metadata store → blob store and fall back to
/// the user-supplied processor only when every tier misses or the source file
/// changed. A per-path mutex guarantees at most one in-flight processor call
/// per key; durable state (blob, then metadata) is always written before
/// memory admission so a crash at any point is recovered by the next request
/// or the next sweep.
///
/// Backends are opened lazily on first use. The default backend is the
/// embedded relational store at `<cache_dir>/metadata.db`; any other
/// [`MetadataStore`] can be injected with [`ContentCache::with_store`].
pub struct ContentCache {
    config: CacheConfig,
    validator: PathValidator,
    memory: MemoryCache,
    filter: NegativeFilter,
    locks: PathLocks,
    integrity: IntegrityChecker,
    blobs: BlobStore,
    metrics: MetricsRecorder,
    store: OnceCell<Arc<dyn MetadataStore>>,
}

enum Lookup {
    Hit(CachedContent),
    Miss { old_hash: Option<String> },
}

impl ContentCache {
    /// Build a cache over the embedded relational backend.
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, OnceCell::new()))
    }

    /// Build a cache over an injected metadata backend (e.g. the remote KV
    /// store).
    pub fn with_store(config: CacheConfig, store: Arc<dyn MetadataStore>) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, OnceCell::new_with(Some(store))))
    }

    fn build(config: CacheConfig, store: OnceCell<Arc<dyn MetadataStore>>) -> Self {
        Self {
            validator: PathValidator::new(config.allowed_paths.clone()),
            memory: MemoryCache::new(config.memory_budget_bytes as usize),
            filter: NegativeFilter::new(config.filter_capacity),
            locks: PathLocks::new(),
            integrity: IntegrityChecker::new(config.verify_hash),
            blobs: BlobStore::new(config.cache_dir.join("blobs"), config.compression_level),
            metrics: MetricsRecorder::new(),
            store,
            config,
        }
    }

    /// Open the backend and create the on-disk layout. Idempotent; also runs
    /// implicitly on first use.
    pub async fn initialize(&self) -> Result<()> {
        self.store_handle().await.map(|_| ())
    }

    async fn store_handle(&self) -> Result<&Arc<dyn MetadataStore>> {
        self.store
            .get_or_try_init(|| async {
                tokio::fs::create_dir_all(&self.config.cache_dir).await?;
                let db_path = self.config.cache_dir.join("metadata.db");
                let storage =
                    SqliteStorage::connect(&db_path, self.config.backend_pool_size).await?;
                info!(cache_dir = %self.config.cache_dir.display(), "content cache initialized");
                Ok(Arc::new(storage) as Arc<dyn MetadataStore>)
            })
            .await
    }

    /// Release backend resources. Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        match self.store.get() {
            Some(store) => store.close().await,
            None => Ok(()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    /// Get the extracted content for `path`, invoking `processor` only when
    /// no tier holds a valid entry for the file's current state.
    pub async fn get<P>(&self, path: impl AsRef<Path>, processor: &P) -> Result<CachedContent>
    where
        P: ContentProcessor + ?Sized,
    {
        self.initialize().await?;
        let started = Instant::now();
        let result = self.get_inner(path.as_ref(), processor).await;
        match &result {
            Ok(content) => self.metrics.observe_request(started, content.from_cache),
            Err(e) => {
                self.metrics.record_error(e.kind());
                self.metrics.observe_request(started, false);
            }
        }
        result
    }

    async fn get_inner<P>(&self, path: &Path, processor: &P) -> Result<CachedContent>
    where
        P: ContentProcessor + ?Sized,
    {
        self.validator.reject_traversal(path)?;
        let raw_key = path.to_string_lossy().into_owned();

        // Validation decides traversal and allowlist rejections before the
        // negative filter is consulted, so a recorded-missing path outside
        // the allowlist is still denied. A missing allowlisted path costs
        // only the validator's own probe; the filter tracks the repeats.
        let canonical = match self.validator.resolve(path).await {
            Ok(resolved) => resolved,
            Err(e @ CacheError::SourceMissing(_)) => {
                if self.filter.contains(&raw_key) {
                    self.metrics.record_bloom_hit();
                } else {
                    self.filter.insert(&raw_key);
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let store = self.store_handle().await?.clone();
        if self.config.debug {
            debug!(path = %canonical.display(), "cache lookup");
        }

        if let Lookup::Hit(content) = self.try_cached(&store, &canonical, &raw_key).await? {
            return Ok(content);
        }

        // Miss path: serialize per key, then re-check every tier before
        // paying for a fingerprint or processor call.
        let _guard = self.locks.acquire(&canonical).await;
        let old_hash = match self.try_cached(&store, &canonical, &raw_key).await? {
            Lookup::Hit(content) => return Ok(content),
            Lookup::Miss { old_hash } => old_hash,
        };

        let snap = match fingerprint::snapshot_file(&canonical).await {
            Ok(snap) => snap,
            Err(e @ CacheError::SourceMissing(_)) => {
                self.filter.insert(&raw_key);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        // Content-address hit: another path already produced this content.
        let mut reused = None;
        for candidate in store.get_by_hash(&snap.content_hash).await? {
            if candidate.path != canonical {
                if let Some(content) = self.materialize(&store, &candidate).await? {
                    reused = Some(content);
                    break;
                }
            }
        }

        let (content, from_cache) = match reused {
            Some(content) => {
                self.metrics.record_dedupe_hit();
                if self.config.debug {
                    debug!(path = %canonical.display(), hash = %snap.content_hash, "dedupe hit");
                }
                (content, true)
            }
            None => {
                let content = processor
                    .process(&canonical)
                    .await
                    .map_err(|e| CacheError::ProcessingError(e.to_string()))?;
                (content, false)
            }
        };

        let now = Utc::now();
        let mut entry = CacheEntry {
            path: canonical.clone(),
            content_hash: snap.content_hash.clone(),
            mtime: snap.mtime,
            file_size: snap.file_size,
            content: Some(content.clone()),
            blob_ref: None,
            extracted_at: now,
            access_count: 0,
            last_accessed: now,
            created_at: now,
        };

        // Durable state first: blob, then metadata, then memory. A crash
        // between the writes leaves at worst an orphan blob for the sweeper.
        if content.len() > INLINE_THRESHOLD {
            self.blobs.put(&snap.content_hash, &content).await?;
            entry.blob_ref = Some(snap.content_hash.clone());
            entry.content = None;
        }
        store.put(&entry).await?;

        if let Some(old) = old_hash {
            if old != snap.content_hash {
                self.collect_blob_if_unreferenced(&store, &old).await;
            }
        }

        entry.content = Some(content.clone());
        let evicted = self.memory.admit(entry);
        self.metrics.record_evictions(evicted as u64);
        self.metrics.set_memory_usage(self.memory.current_bytes() as u64);

        Ok(CachedContent {
            content,
            from_cache,
            content_hash: snap.content_hash,
            extracted_at: now,
            file_size: snap.file_size,
        })
    }

    /// Memory then metadata lookup with integrity validation. Returns the
    /// previous content hash on a stale entry so the caller can collect its
    /// blob after replacement.
    async fn try_cached(
        &self,
        store: &Arc<dyn MetadataStore>,
        canonical: &Path,
        raw_key: &str,
    ) -> Result<Lookup> {
        if let Some(entry) = self.memory.lookup(canonical) {
            match self.integrity.check(&entry).await? {
                IntegrityStatus::Valid => {
                    if let Some(content) = entry.content.clone() {
                        self.spawn_touch(store, &entry);
                        return Ok(Lookup::Hit(CachedContent {
                            content,
                            from_cache: true,
                            content_hash: entry.content_hash.clone(),
                            extracted_at: entry.extracted_at,
                            file_size: entry.file_size,
                        }));
                    }
                    self.memory.evict(canonical);
                }
                IntegrityStatus::FileMissing => {
                    self.invalidate_canonical(store, canonical).await?;
                    self.filter.insert(raw_key);
                    return Err(CacheError::SourceMissing(canonical.display().to_string()));
                }
                IntegrityStatus::FileModified | IntegrityStatus::ContentChanged => {
                    self.memory.evict(canonical);
                }
            }
        }

        if let Some(entry) = store.get_by_path(canonical).await? {
            match self.integrity.check(&entry).await? {
                IntegrityStatus::Valid => {
                    if let Some(content) = self.materialize(store, &entry).await? {
                        let mut promoted = entry.clone();
                        promoted.content = Some(content.clone());
                        promoted.touch();
                        let evicted = self.memory.admit(promoted.clone());
                        self.metrics.record_evictions(evicted as u64);
                        self.metrics.set_memory_usage(self.memory.current_bytes() as u64);
                        self.spawn_touch(store, &promoted);
                        return Ok(Lookup::Hit(CachedContent {
                            content,
                            from_cache: true,
                            content_hash: entry.content_hash,
                            extracted_at: entry.extracted_at,
                            file_size: entry.file_size,
                        }));
                    }
                    // Blob lost or corrupt: reprocess, replacing the record.
                    return Ok(Lookup::Miss {
                        old_hash: Some(entry.content_hash),
                    });
                }
                IntegrityStatus::FileMissing => {
                    self.invalidate_canonical(store, canonical).await?;
                    self.filter.insert(raw_key);
                    return Err(CacheError::SourceMissing(canonical.display().to_string()));
                }
                IntegrityStatus::FileModified | IntegrityStatus::ContentChanged => {
                    return Ok(Lookup::Miss {
                        old_hash: Some(entry.content_hash),
                    });
                }
            }
        }

        Ok(Lookup::Miss { old_hash: None })
    }

    /// Resolve an entry's content, reading the blob store when it is held by
    /// reference. A corrupt blob invalidates the entry and reads as a miss so
    /// the caller reprocesses.
    async fn materialize(
        &self,
        store: &Arc<dyn MetadataStore>,
        entry: &CacheEntry,
    ) -> Result<Option<String>> {
        if let Some(content) = &entry.content {
            return Ok(Some(content.clone()));
        }
        let Some(blob_ref) = &entry.blob_ref else {
            return Ok(None);
        };
        match self.blobs.get(blob_ref).await {
            Ok(found) => Ok(found),
            Err(CacheError::IntegrityFault(msg)) => {
                warn!(path = %entry.path.display(), %msg, "corrupt blob, invalidating entry");
                self.invalidate_canonical(store, &entry.path).await?;
                let _ = self.blobs.delete(blob_ref).await;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn spawn_touch(&self, store: &Arc<dyn MetadataStore>, entry: &CacheEntry) {
        let store = store.clone();
        let path = entry.path.clone();
        let last_accessed = entry.last_accessed;
        let access_count = entry.access_count;
        tokio::spawn(async move {
            if let Err(e) = store.touch(&path, last_accessed, access_count).await {
                warn!(path = %path.display(), error = %e, "failed to record access");
            }
        });
    }

    /// Run up to `max_concurrent` gets in parallel, preserving input order in
    /// the result list.
    pub async fn get_batch<P>(
        &self,
        paths: &[PathBuf],
        processor: &P,
        max_concurrent: usize,
    ) -> Vec<Result<CachedContent>>
    where
        P: ContentProcessor + ?Sized,
    {
        let semaphore = Semaphore::new(max_concurrent.max(1));
        join_all(paths.iter().map(|path| {
            let semaphore = &semaphore;
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| CacheError::StorageFailure("batch semaphore closed".into()))?;
                self.get(path, processor).await
            }
        }))
        .await
    }

    /// Remove a path from every tier. Returns true if any tier held it.
    pub async fn invalidate(&self, path: impl AsRef<Path>) -> Result<bool> {
        self.initialize().await?;
        let path = path.as_ref();
        let store = self.store_handle().await?.clone();
        let key = match tokio::fs::canonicalize(path).await {
            Ok(resolved) => resolved,
            // The file may already be gone; fall back to the absolute form.
            Err(_) if path.is_absolute() => path.to_path_buf(),
            Err(_) => std::env::current_dir()?.join(path),
        };
        self.invalidate_canonical(&store, &key).await
    }

    async fn invalidate_canonical(
        &self,
        store: &Arc<dyn MetadataStore>,
        path: &Path,
    ) -> Result<bool> {
        let removed_memory = self.memory.evict(path);
        let hash = store.get_by_path(path).await?.map(|e| e.content_hash);
        let removed_store = store.delete_by_path(path).await?;
        if let Some(hash) = hash {
            self.collect_blob_if_unreferenced(store, &hash).await;
        }
        self.metrics.set_memory_usage(self.memory.current_bytes() as u64);
        Ok(removed_memory || removed_store)
    }

    async fn collect_blob_if_unreferenced(&self, store: &Arc<dyn MetadataStore>, hash: &str) {
        match store.get_by_hash(hash).await {
            Ok(remaining) if remaining.is_empty() => {
                if let Err(e) = self.blobs.delete(hash).await {
                    warn!(hash, error = %e, "failed to collect blob");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(hash, error = %e, "blob reference check failed"),
        }
    }

    /// Invalidate many paths in parallel; returns the number of entries
    /// actually removed. Individual failures are logged, not surfaced.
    pub async fn invalidate_batch(&self, paths: &[PathBuf]) -> Result<u64> {
        self.initialize().await?;
        let results = join_all(paths.iter().map(|path| self.invalidate(path))).await;
        let mut removed = 0;
        for (path, result) in paths.iter().zip(results) {
            match result {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "invalidation failed"),
            }
        }
        Ok(removed)
    }

    /// Remove entries not accessed for `age_days`, then collect every blob no
    /// metadata record references (including orphans from interrupted
    /// writes). Returns the number of entries removed.
    pub async fn sweep_old(&self, age_days: u64) -> Result<u64> {
        self.initialize().await?;
        let store = self.store_handle().await?.clone();
        let cutoff = Utc::now() - chrono::Duration::days(age_days as i64);

        let stale = store.older_than(cutoff).await?;
        let mut removed = 0u64;
        for entry in &stale {
            self.memory.evict(&entry.path);
            if store.delete_by_path(&entry.path).await? {
                removed += 1;
            }
        }

        let live: HashSet<String> = store.count_by_hash().await?.into_keys().collect();
        let collected = self.blobs.sweep_unreferenced(&live).await?;

        self.metrics.set_memory_usage(self.memory.current_bytes() as u64);
        info!(removed, blobs_collected = collected, "sweep finished");
        Ok(removed)
    }

    /// Point-in-time statistics combining request counters with storage
    /// utilization.
    pub async fn statistics(&self) -> Result<CacheStatistics> {
        self.initialize().await?;
        let store = self.store_handle().await?.clone();

        let totals = store.totals().await?;
        let counts = store.count_by_hash().await?;
        let blob_bytes = self.blobs.disk_usage().await?;
        let unique_hashes = counts.len() as u64;
        let duplicate_groups = counts.values().filter(|&&refs| refs > 1).count() as u64;
        let memory_bytes = self.memory.current_bytes() as u64;

        self.metrics.set_memory_usage(memory_bytes);
        self.metrics.set_disk_usage(blob_bytes);
        self.metrics.set_entry_count(totals.entry_count);

        Ok(CacheStatistics {
            total_requests: self.metrics.total_requests(),
            cache_hits: self.metrics.cache_hits(),
            cache_misses: self.metrics.cache_misses(),
            bloom_filter_hits: self.metrics.bloom_filter_hits(),
            dedupe_hits: self.metrics.dedupe_hits(),
            hit_rate: self.metrics.hit_rate(),
            memory_usage_mb: memory_bytes as f64 / (1024.0 * 1024.0),
            memory_entries: self.memory.len() as u64,
            disk_usage_bytes: blob_bytes,
            content_bytes: totals.total_bytes,
            entry_count: totals.entry_count,
            unique_hashes,
            duplicate_groups,
            errors: self.metrics.error_counts(),
        })
    }

    /// Metrics in the Prometheus text exposition format.
    pub fn metrics_prometheus(&self) -> String {
        self.metrics.render()
    }
}
