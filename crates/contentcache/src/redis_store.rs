use crate::fingerprint::hash_bytes;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use contentcache_core::{CacheEntry, CacheError, MetadataStore, Result, StoreTotals};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// Remote KV metadata backend.
///
/// Entries are stored as JSON strings under `{prefix}:entry:{sha256(path)}`;
/// a set per content hash at `{prefix}:hash:{hash}` holds the paths sharing
/// that content, a sorted set at `{prefix}:atime` indexes entries by last
/// access, and running totals live in the `{prefix}:stats` hash. Every
/// multi-key mutation runs as a single Lua script, so concurrent writers
/// observe per-key last-writer-wins without torn index updates.
#[derive(Clone)]
pub struct RedisStorage {
    conn: ConnectionManager,
    prefix: String,
}

const PUT_SCRIPT: &str = r#"
if ARGV[4] == '0' then
    redis.call('HINCRBY', KEYS[5], 'entry_count', 1)
end
redis.call('SET', KEYS[1], ARGV[1])
redis.call('SADD', KEYS[2], ARGV[2])
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[2])
if KEYS[4] ~= KEYS[2] then
    redis.call('SREM', KEYS[4], ARGV[2])
    if redis.call('SCARD', KEYS[4]) == 0 then
        redis.call('DEL', KEYS[4])
    end
end
redis.call('HINCRBY', KEYS[5], 'total_bytes', ARGV[5])
return 1
"#;

const DELETE_SCRIPT: &str = r#"
if redis.call('DEL', KEYS[1]) == 0 then
    return 0
end
redis.call('SREM', KEYS[2], ARGV[1])
if redis.call('SCARD', KEYS[2]) == 0 then
    redis.call('DEL', KEYS[2])
end
redis.call('ZREM', KEYS[3], ARGV[1])
redis.call('HINCRBY', KEYS[4], 'entry_count', -1)
redis.call('HINCRBY', KEYS[4], 'total_bytes', -ARGV[2])
return 1
"#;

const TOUCH_SCRIPT: &str = r#"
redis.call('SET', KEYS[1], ARGV[1])
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
return 1
"#;

impl RedisStorage {
    /// Connect with the default `cache` key prefix.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_prefix(url, "cache").await
    }

    /// Connect with a custom prefix for namespace isolation.
    pub async fn connect_with_prefix(url: &str, prefix: &str) -> Result<Self> {
        let client = Client::open(url).map_err(|e| kv_err("open client", e))?;
        let mut conn = ConnectionManager::new(client)
            .await
            .map_err(|e| kv_err("connect", e))?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| kv_err("ping", e))?;
        info!(prefix, "connected remote metadata store");
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    fn entry_key(&self, path: &Path) -> String {
        format!(
            "{}:entry:{}",
            self.prefix,
            hash_bytes(path.to_string_lossy().as_bytes())
        )
    }

    fn hash_key(&self, content_hash: &str) -> String {
        format!("{}:hash:{}", self.prefix, content_hash)
    }

    fn atime_key(&self) -> String {
        format!("{}:atime", self.prefix)
    }

    fn stats_key(&self) -> String {
        format!("{}:stats", self.prefix)
    }

    async fn fetch(&self, path: &Path) -> Result<Option<CacheEntry>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(self.entry_key(path))
            .await
            .map_err(|e| kv_err("get entry", e))?;
        raw.map(|json| {
            serde_json::from_str(&json)
                .map_err(|e| CacheError::StorageFailure(format!("decode entry: {e}")))
        })
        .transpose()
    }
}

/// Sorted-set score for an access timestamp: seconds with millisecond
/// precision.
fn access_score(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

fn kv_err(op: &str, err: redis::RedisError) -> CacheError {
    CacheError::StorageFailure(format!("{op}: {err}"))
}

#[async_trait]
impl MetadataStore for RedisStorage {
    async fn get_by_path(&self, path: &Path) -> Result<Option<CacheEntry>> {
        self.fetch(path).await
    }

    async fn get_by_hash(&self, content_hash: &str) -> Result<Vec<CacheEntry>> {
        let mut conn = self.conn.clone();
        let paths: Vec<String> = conn
            .smembers(self.hash_key(content_hash))
            .await
            .map_err(|e| kv_err("read hash index", e))?;

        let mut entries = Vec::with_capacity(paths.len());
        for path in paths {
            if let Some(entry) = self.fetch(Path::new(&path)).await? {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn put(&self, entry: &CacheEntry) -> Result<()> {
        let existing = self.fetch(&entry.path).await?;

        let mut stored = entry.clone();
        let (existed, old_hash, prev_size) = match &existing {
            Some(prev) => {
                stored.access_count = prev.access_count;
                stored.created_at = prev.created_at;
                (true, prev.content_hash.clone(), prev.file_size as i64)
            }
            None => (false, entry.content_hash.clone(), 0),
        };

        let json = serde_json::to_string(&stored)
            .map_err(|e| CacheError::StorageFailure(format!("encode entry: {e}")))?;
        let path_str = entry.path.to_string_lossy().into_owned();
        let delta = entry.file_size as i64 - prev_size;

        let mut conn = self.conn.clone();
        Script::new(PUT_SCRIPT)
            .key(self.entry_key(&entry.path))
            .key(self.hash_key(&entry.content_hash))
            .key(self.atime_key())
            .key(self.hash_key(&old_hash))
            .key(self.stats_key())
            .arg(json)
            .arg(path_str)
            .arg(access_score(stored.last_accessed))
            .arg(if existed { "1" } else { "0" })
            .arg(delta)
            .invoke_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| kv_err("put entry", e))?;
        Ok(())
    }

    async fn delete_by_path(&self, path: &Path) -> Result<bool> {
        let Some(existing) = self.fetch(path).await? else {
            return Ok(false);
        };

        let mut conn = self.conn.clone();
        let removed: i64 = Script::new(DELETE_SCRIPT)
            .key(self.entry_key(path))
            .key(self.hash_key(&existing.content_hash))
            .key(self.atime_key())
            .key(self.stats_key())
            .arg(path.to_string_lossy().into_owned())
            .arg(existing.file_size as i64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| kv_err("delete entry", e))?;
        Ok(removed > 0)
    }

    async fn touch(
        &self,
        path: &Path,
        last_accessed: DateTime<Utc>,
        access_count: u64,
    ) -> Result<()> {
        let Some(mut entry) = self.fetch(path).await? else {
            return Ok(());
        };
        entry.last_accessed = last_accessed;
        entry.access_count = access_count;

        let json = serde_json::to_string(&entry)
            .map_err(|e| CacheError::StorageFailure(format!("encode entry: {e}")))?;
        let mut conn = self.conn.clone();
        Script::new(TOUCH_SCRIPT)
            .key(self.entry_key(path))
            .key(self.atime_key())
            .arg(json)
            .arg(access_score(last_accessed))
            .arg(path.to_string_lossy().into_owned())
            .invoke_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| kv_err("touch entry", e))?;
        Ok(())
    }

    async fn older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<CacheEntry>> {
        let mut conn = self.conn.clone();
        let paths: Vec<String> = conn
            .zrangebyscore(self.atime_key(), "-inf", access_score(cutoff))
            .await
            .map_err(|e| kv_err("scan access index", e))?;

        let mut entries = Vec::with_capacity(paths.len());
        for path in paths {
            if let Some(entry) = self.fetch(Path::new(&path)).await? {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn count_by_hash(&self) -> Result<HashMap<String, u64>> {
        let pattern = format!("{}:hash:*", self.prefix);
        let index_prefix = format!("{}:hash:", self.prefix);

        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        {
            let mut iter = conn
                .scan_match::<_, String>(&pattern)
                .await
                .map_err(|e| kv_err("scan hash index", e))?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }

        let mut counts = HashMap::with_capacity(keys.len());
        for key in keys {
            let refs: u64 = conn.scard(&key).await.map_err(|e| kv_err("count refs", e))?;
            if let Some(hash) = key.strip_prefix(&index_prefix) {
                counts.insert(hash.to_string(), refs);
            }
        }
        Ok(counts)
    }

    async fn totals(&self) -> Result<StoreTotals> {
        let mut conn = self.conn.clone();
        let stats: HashMap<String, i64> = conn
            .hgetall(self.stats_key())
            .await
            .map_err(|e| kv_err("read stats", e))?;
        Ok(StoreTotals {
            entry_count: stats.get("entry_count").copied().unwrap_or(0).max(0) as u64,
            total_bytes: stats.get("total_bytes").copied().unwrap_or(0).max(0) as u64,
        })
    }

    async fn close(&self) -> Result<()> {
        // The connection manager owns no pooled resources that need explicit
        // shutdown; dropping the last clone closes the connection.
        Ok(())
    }
}
