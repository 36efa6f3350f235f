use contentcache_core::{CacheError, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Content-addressed compressed byte storage under `<root>/hh/hh/<hash>.z`.
///
/// Writes are write-to-temp-then-rename, so readers never observe a partial
/// blob and a cancelled write leaves at worst an orphan temp file. The
/// two-level fan-out keeps directories small at millions of blobs.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
    compression_level: u32,
}

impl BlobStore {
    pub fn new(root: PathBuf, compression_level: u32) -> Self {
        Self {
            root,
            compression_level,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, hash: &str) -> Result<PathBuf> {
        if hash.len() < 4 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CacheError::StorageFailure(format!(
                "malformed blob hash {hash:?}"
            )));
        }
        Ok(self
            .root
            .join(&hash[..2])
            .join(&hash[2..4])
            .join(format!("{hash}.z")))
    }

    /// Compress and store content under its hash. Returns the blob path.
    pub async fn put(&self, hash: &str, content: &str) -> Result<PathBuf> {
        let path = self.blob_path(hash)?;
        let parent = path
            .parent()
            .ok_or_else(|| CacheError::StorageFailure("blob path has no parent".into()))?
            .to_path_buf();
        tokio::fs::create_dir_all(&parent).await?;

        let level = self.compression_level;
        let owned = content.to_owned();
        let compressed = tokio::task::spawn_blocking(move || compress(&owned, level))
            .await
            .map_err(|e| CacheError::StorageFailure(format!("compression task failed: {e}")))??;

        let tmp = parent.join(format!(
            ".{hash}.{}.{}.tmp",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        if let Err(e) = tokio::fs::write(&tmp, &compressed).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(hash, bytes = compressed.len(), "stored blob");
        Ok(path)
    }

    /// Retrieve and decompress a blob. `Ok(None)` when absent; a blob that
    /// fails the decompression checksum is an `IntegrityFault`.
    pub async fn get(&self, hash: &str) -> Result<Option<String>> {
        let path = self.blob_path(hash)?;
        let compressed = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let hash_owned = hash.to_owned();
        let content = tokio::task::spawn_blocking(move || decompress(&compressed, &hash_owned))
            .await
            .map_err(|e| CacheError::StorageFailure(format!("decompression task failed: {e}")))??;
        Ok(Some(content))
    }

    /// Delete a blob, pruning now-empty fan-out directories.
    pub async fn delete(&self, hash: &str) -> Result<bool> {
        let path = self.blob_path(hash)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        // Opportunistic: only removes directories that are already empty.
        let mut dir = path.parent();
        for _ in 0..2 {
            match dir {
                Some(d) if d != self.root => {
                    if tokio::fs::remove_dir(d).await.is_err() {
                        break;
                    }
                    dir = d.parent();
                }
                _ => break,
            }
        }
        Ok(true)
    }

    pub async fn exists(&self, hash: &str) -> Result<bool> {
        let path = self.blob_path(hash)?;
        Ok(tokio::fs::metadata(&path).await.is_ok())
    }

    /// Compressed on-disk size of one blob; 0 when absent.
    pub async fn compressed_size(&self, hash: &str) -> Result<u64> {
        let path = self.blob_path(hash)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Total compressed bytes across all stored blobs.
    pub async fn disk_usage(&self) -> Result<u64> {
        let mut total = 0u64;
        for (_, path) in self.list_blobs().await? {
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                total += meta.len();
            }
        }
        Ok(total)
    }

    /// Delete every blob whose hash is not in `live`. Returns the number
    /// removed.
    pub async fn sweep_unreferenced(&self, live: &HashSet<String>) -> Result<u64> {
        let mut removed = 0u64;
        for (hash, _path) in self.list_blobs().await? {
            if live.contains(&hash) {
                continue;
            }
            match self.delete(&hash).await {
                Ok(true) => {
                    removed += 1;
                    debug!(hash, "collected unreferenced blob");
                }
                Ok(false) => {}
                Err(e) => warn!(hash, error = %e, "failed to collect blob"),
            }
        }
        Ok(removed)
    }

    /// Walk the fan-out tree yielding `(hash, path)` pairs for stored blobs.
    /// In-progress temp files (dot-prefixed) are skipped, not reaped; only
    /// their writer may remove them.
    async fn list_blobs(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut blobs = Vec::new();
        let mut level1 = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(blobs),
            Err(e) => return Err(e.into()),
        };

        while let Some(outer) = level1.next_entry().await? {
            if !outer.file_type().await?.is_dir() {
                continue;
            }
            let mut level2 = tokio::fs::read_dir(outer.path()).await?;
            while let Some(inner) = level2.next_entry().await? {
                if !inner.file_type().await?.is_dir() {
                    continue;
                }
                let mut files = tokio::fs::read_dir(inner.path()).await?;
                while let Some(file) = files.next_entry().await? {
                    let name = file.file_name().to_string_lossy().into_owned();
                    if name.starts_with('.') {
                        continue;
                    }
                    if let Some(hash) = name.strip_suffix(".z") {
                        blobs.push((hash.to_string(), file.path()));
                    }
                }
            }
        }
        Ok(blobs)
    }
}

fn compress(content: &str, level: u32) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level));
    encoder
        .write_all(content.as_bytes())
        .and_then(|_| encoder.finish())
        .map_err(|e| CacheError::StorageFailure(format!("compression failed: {e}")))
}

fn decompress(compressed: &[u8], hash: &str) -> Result<String> {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut content = String::new();
    decoder
        .read_to_string(&mut content)
        .map_err(|e| CacheError::IntegrityFault(format!("blob {hash} is corrupt: {e}")))?;
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HASH_A: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
    const HASH_B: &str = "486ea46224d1bb4fb680f34f7c9ad96a8f24ec88be73ea8e5a6c65260e9cb8a7";

    fn store(dir: &TempDir) -> BlobStore {
        BlobStore::new(dir.path().join("blobs"), 6)
    }

    #[tokio::test]
    async fn roundtrips_content() {
        let dir = TempDir::new().unwrap();
        let blobs = store(&dir);

        let written = blobs.put(HASH_A, "extracted text").await.unwrap();
        assert!(written.ends_with(format!("2c/f2/{HASH_A}.z")));

        let content = blobs.get(HASH_A).await.unwrap();
        assert_eq!(content.as_deref(), Some("extracted text"));
    }

    #[tokio::test]
    async fn absent_blob_is_none() {
        let dir = TempDir::new().unwrap();
        assert_eq!(store(&dir).get(HASH_A).await.unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_blob_is_integrity_fault() {
        let dir = TempDir::new().unwrap();
        let blobs = store(&dir);
        blobs.put(HASH_A, "good bytes").await.unwrap();

        let path = blobs.blob_path(HASH_A).unwrap();
        tokio::fs::write(&path, b"definitely not zlib").await.unwrap();

        let err = blobs.get(HASH_A).await.unwrap_err();
        assert_eq!(err.kind(), "integrity_fault");
    }

    #[tokio::test]
    async fn delete_prunes_empty_directories() {
        let dir = TempDir::new().unwrap();
        let blobs = store(&dir);
        blobs.put(HASH_A, "x").await.unwrap();

        assert!(blobs.delete(HASH_A).await.unwrap());
        assert!(!blobs.delete(HASH_A).await.unwrap());
        assert!(!dir.path().join("blobs").join("2c").exists());
    }

    #[tokio::test]
    async fn sweep_removes_only_unreferenced() {
        let dir = TempDir::new().unwrap();
        let blobs = store(&dir);
        blobs.put(HASH_A, "keep me").await.unwrap();
        blobs.put(HASH_B, "orphan").await.unwrap();

        let live: HashSet<String> = [HASH_A.to_string()].into_iter().collect();
        let removed = blobs.sweep_unreferenced(&live).await.unwrap();

        assert_eq!(removed, 1);
        assert!(blobs.exists(HASH_A).await.unwrap());
        assert!(!blobs.exists(HASH_B).await.unwrap());
    }

    #[tokio::test]
    async fn disk_usage_counts_compressed_bytes() {
        let dir = TempDir::new().unwrap();
        let blobs = store(&dir);
        assert_eq!(blobs.disk_usage().await.unwrap(), 0);

        blobs.put(HASH_A, &"text ".repeat(1000)).await.unwrap();
        let usage = blobs.disk_usage().await.unwrap();
        assert!(usage > 0);
        assert_eq!(usage, blobs.compressed_size(HASH_A).await.unwrap());
    }

    #[tokio::test]
    async fn compression_level_zero_still_roundtrips() {
        let dir = TempDir::new().unwrap();
        let blobs = BlobStore::new(dir.path().join("blobs"), 0);
        blobs.put(HASH_A, "stored raw-ish").await.unwrap();
        assert_eq!(
            blobs.get(HASH_A).await.unwrap().as_deref(),
            Some("stored raw-ish")
        );
    }
}
