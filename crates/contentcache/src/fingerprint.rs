use contentcache_core::{CacheError, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncReadExt;

/// Chunk size for cooperative hashing; each chunk read is an await point so
/// large files do not starve other tasks.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Size, mtime and content hash of a file captured in one pass.
#[derive(Debug, Clone)]
pub struct FileSnapshot {
    pub content_hash: String,
    pub file_size: u64,
    pub mtime: f64,
}

/// SHA-256 over a byte slice as lowercase hex.
pub fn hash_bytes(bytes: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes.as_ref());
    format!("{:x}", hasher.finalize())
}

/// SHA-256 of a file's contents, read in [`CHUNK_SIZE`] chunks.
pub async fn hash_file(path: &Path) -> Result<String> {
    Ok(snapshot_file(path).await?.content_hash)
}

/// Hash a file and capture its size and mtime from the same open handle, so
/// the metadata describes the bytes that were hashed.
pub async fn snapshot_file(path: &Path) -> Result<FileSnapshot> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| read_error(path, e))?;
    let meta = file.metadata().await.map_err(|e| read_error(path, e))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await.map_err(|e| read_error(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(FileSnapshot {
        content_hash: format!("{:x}", hasher.finalize()),
        file_size: meta.len(),
        mtime: meta
            .modified()
            .map(epoch_seconds)
            .map_err(|e| read_error(path, e))?,
    })
}

/// Seconds since the Unix epoch with sub-second precision.
pub fn epoch_seconds(t: SystemTime) -> f64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn read_error(path: &Path, err: std::io::Error) -> CacheError {
    if err.kind() == std::io::ErrorKind::NotFound {
        CacheError::SourceMissing(path.display().to_string())
    } else {
        CacheError::StorageFailure(format!("reading {}: {}", path.display(), err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[tokio::test]
    async fn hashes_known_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();

        assert_eq!(hash_file(&path).await.unwrap(), HELLO_SHA256);
        assert_eq!(hash_bytes(b"hello"), HELLO_SHA256);
    }

    #[tokio::test]
    async fn snapshot_captures_size_and_mtime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let snap = snapshot_file(&path).await.unwrap();
        assert_eq!(snap.file_size, 5);
        assert!(snap.mtime > 0.0);
        assert_eq!(snap.content_hash, HELLO_SHA256);
    }

    #[tokio::test]
    async fn chunked_read_matches_single_shot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.bin");
        let payload = vec![0xA5u8; CHUNK_SIZE * 2 + 17];
        tokio::fs::write(&path, &payload).await.unwrap();

        assert_eq!(hash_file(&path).await.unwrap(), hash_bytes(&payload));
    }

    #[tokio::test]
    async fn missing_file_is_source_missing() {
        let err = hash_file(Path::new("/definitely/not/here")).await.unwrap_err();
        assert_eq!(err.kind(), "source_missing");
    }
}
