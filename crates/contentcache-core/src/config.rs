use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const MIN_MEMORY_BUDGET: u64 = 1024 * 1024;
const MAX_MEMORY_BUDGET: u64 = 10 * 1024 * 1024 * 1024;

/// Immutable cache configuration.
///
/// Defaults work out of the box; every option can also be overridden by a
/// same-named upper-case environment variable via [`CacheConfig::from_env`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Root of all on-disk state (`metadata.db` and `blobs/`).
    pub cache_dir: PathBuf,
    /// Byte budget for the memory tier.
    pub memory_budget_bytes: u64,
    /// Recompute content hashes during integrity checks.
    pub verify_hash: bool,
    /// Maximum concurrent connections held by the metadata backend.
    pub backend_pool_size: u32,
    /// Deflate level for blob compression, 0..=9.
    pub compression_level: u32,
    /// Expected capacity of the negative-existence filter.
    pub filter_capacity: usize,
    /// Emit verbose per-request diagnostics.
    pub debug: bool,
    /// Allowlist of directories inputs must live under; empty means
    /// unrestricted.
    pub allowed_paths: Vec<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./cache_storage"),
            memory_budget_bytes: 100 * 1024 * 1024,
            verify_hash: true,
            backend_pool_size: 10,
            compression_level: 6,
            filter_capacity: 1_000_000,
            debug: false,
            allowed_paths: Vec::new(),
        }
    }
}

impl CacheConfig {
    /// Defaults overridden by environment variables: `CACHE_DIR`,
    /// `MEMORY_BUDGET_BYTES`, `VERIFY_HASH`, `BACKEND_POOL_SIZE`,
    /// `COMPRESSION_LEVEL`, `FILTER_CAPACITY`, `DEBUG` and `ALLOWED_PATHS`
    /// (platform path-separator separated).
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(dir) = env_var("CACHE_DIR") {
            config.cache_dir = PathBuf::from(dir);
        }
        if let Some(v) = env_parse::<u64>("MEMORY_BUDGET_BYTES")? {
            config.memory_budget_bytes = v;
        }
        if let Some(v) = env_bool("VERIFY_HASH")? {
            config.verify_hash = v;
        }
        if let Some(v) = env_parse::<u32>("BACKEND_POOL_SIZE")? {
            config.backend_pool_size = v;
        }
        if let Some(v) = env_parse::<u32>("COMPRESSION_LEVEL")? {
            config.compression_level = v;
        }
        if let Some(v) = env_parse::<usize>("FILTER_CAPACITY")? {
            config.filter_capacity = v;
        }
        if let Some(v) = env_bool("DEBUG")? {
            config.debug = v;
        }
        if let Some(raw) = env_var("ALLOWED_PATHS") {
            config.allowed_paths = std::env::split_paths(&raw).collect();
        }

        config.validate()?;
        Ok(config)
    }

    /// Construction-time sanity checks; violations are [`CacheError::ConfigInvalid`].
    pub fn validate(&self) -> Result<()> {
        if self.memory_budget_bytes < MIN_MEMORY_BUDGET {
            return Err(CacheError::ConfigInvalid(format!(
                "memory budget must be at least {} bytes, got {}",
                MIN_MEMORY_BUDGET, self.memory_budget_bytes
            )));
        }
        if self.memory_budget_bytes > MAX_MEMORY_BUDGET {
            return Err(CacheError::ConfigInvalid(format!(
                "memory budget must not exceed {} bytes, got {}",
                MAX_MEMORY_BUDGET, self.memory_budget_bytes
            )));
        }
        if self.compression_level > 9 {
            return Err(CacheError::ConfigInvalid(format!(
                "compression level must be within 0..=9, got {}",
                self.compression_level
            )));
        }
        if self.backend_pool_size == 0 {
            return Err(CacheError::ConfigInvalid(
                "backend pool size must be at least 1".into(),
            ));
        }
        if self.filter_capacity == 0 {
            return Err(CacheError::ConfigInvalid(
                "filter capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env_var(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| CacheError::ConfigInvalid(format!("{key}={raw:?} is not valid"))),
        None => Ok(None),
    }
}

fn env_bool(key: &str) -> Result<Option<bool>> {
    match env_var(key) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" => Ok(Some(false)),
            _ => Err(CacheError::ConfigInvalid(format!(
                "{key}={raw:?} is not a boolean"
            ))),
        },
        None => Ok(None),
    }
}
