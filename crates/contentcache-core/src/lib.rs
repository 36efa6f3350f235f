pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use traits::{ContentProcessor, MetadataStore};
pub use types::{CacheEntry, CachedContent, IntegrityStatus, StoreTotals};
