pub mod blob;
pub mod cache;
pub mod filter;
pub mod fingerprint;
pub mod integrity;
pub mod locks;
pub mod memory;
pub mod metrics;
pub mod redis_store;
pub mod sqlite_store;
pub mod validate;

pub use blob::BlobStore;
pub use cache::{ContentCache, INLINE_THRESHOLD};
pub use filter::NegativeFilter;
pub use fingerprint::{FileSnapshot, CHUNK_SIZE};
pub use integrity::IntegrityChecker;
pub use locks::PathLocks;
pub use memory::MemoryCache;
pub use metrics::{CacheStatistics, MetricsRecorder};
pub use redis_store::RedisStorage;
pub use sqlite_store::SqliteStorage;
pub use validate::PathValidator;

// Re-export common types for convenience
pub use contentcache_core::{
    CacheConfig, CacheEntry, CacheError, CachedContent, ContentProcessor, IntegrityStatus,
    MetadataStore, Result, StoreTotals,
};
