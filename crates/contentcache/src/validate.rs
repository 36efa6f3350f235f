use contentcache_core::{CacheError, Result};
use std::path::{Path, PathBuf};

/// Rejects inputs outside the configured allowlist and inputs carrying
/// traversal patterns, producing the canonical path used as the cache key.
#[derive(Debug, Clone, Default)]
pub struct PathValidator {
    allowed_paths: Vec<PathBuf>,
}

impl PathValidator {
    pub fn new(allowed_paths: Vec<PathBuf>) -> Self {
        Self { allowed_paths }
    }

    /// Rejects any raw input containing the literal `..` sequence, before
    /// resolution. Intentionally stricter than component-wise checking: it
    /// also refuses names such as `/a..b/c`.
    pub fn reject_traversal(&self, path: &Path) -> Result<()> {
        if path.to_string_lossy().contains("..") {
            return Err(CacheError::PermissionDenied(format!(
                "path traversal detected: {}",
                path.display()
            )));
        }
        Ok(())
    }

    /// Resolves symlinks, enforces allowlist ancestry and requires a regular
    /// file, in that order. Ancestry is decided before existence, so a
    /// missing path outside the allowlist is `PermissionDenied`, never
    /// `SourceMissing`; only a nonexistent path the allowlist would permit
    /// reports `SourceMissing`, letting the caller feed the
    /// negative-existence filter.
    pub async fn resolve(&self, path: &Path) -> Result<PathBuf> {
        let resolved = match tokio::fs::canonicalize(path).await {
            Ok(resolved) => Some(resolved),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(CacheError::PermissionDenied(format!(
                    "cannot resolve {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        if !self.allowed_paths.is_empty() {
            let checked = match &resolved {
                Some(resolved) => resolved.clone(),
                None => nearest_resolvable(path).await?,
            };
            let mut permitted = false;
            for root in &self.allowed_paths {
                if let Ok(root) = tokio::fs::canonicalize(root).await {
                    if checked.starts_with(&root) {
                        permitted = true;
                        break;
                    }
                }
            }
            if !permitted {
                return Err(CacheError::PermissionDenied(format!(
                    "{} is not within the allowed paths",
                    path.display()
                )));
            }
        }

        let Some(resolved) = resolved else {
            return Err(CacheError::SourceMissing(path.display().to_string()));
        };

        let meta = tokio::fs::metadata(&resolved).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CacheError::SourceMissing(path.display().to_string())
            } else {
                CacheError::StorageFailure(format!("stat {}: {}", resolved.display(), e))
            }
        })?;
        if !meta.is_file() {
            return Err(CacheError::PermissionDenied(format!(
                "{} is not a regular file",
                resolved.display()
            )));
        }

        Ok(resolved)
    }

    /// Full validation: traversal check then resolution.
    pub async fn validate(&self, path: &Path) -> Result<PathBuf> {
        self.reject_traversal(path)?;
        self.resolve(path).await
    }
}

/// Absolute form for a path that does not (fully) exist: the deepest
/// existing ancestor is resolved through symlinks and the remaining
/// components are re-appended.
async fn nearest_resolvable(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut ancestor = absolute.as_path();
    let mut remainder = Vec::new();
    loop {
        if let Ok(resolved) = tokio::fs::canonicalize(ancestor).await {
            let mut rebuilt = resolved;
            for part in remainder.iter().rev() {
                rebuilt.push(part);
            }
            return Ok(rebuilt);
        }
        match (ancestor.parent(), ancestor.file_name()) {
            (Some(parent), Some(name)) => {
                remainder.push(name.to_os_string());
                ancestor = parent;
            }
            _ => return Ok(absolute.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn accepts_regular_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.txt");
        tokio::fs::write(&file, b"data").await.unwrap();

        let validator = PathValidator::default();
        let resolved = validator.validate(&file).await.unwrap();
        assert!(resolved.is_absolute());
    }

    #[tokio::test]
    async fn rejects_parent_traversal() {
        let validator = PathValidator::default();
        let err = validator
            .validate(Path::new("/tmp/../etc/passwd"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "permission_denied");
    }

    #[tokio::test]
    async fn rejects_dotdot_substring() {
        let validator = PathValidator::default();
        let err = validator
            .validate(Path::new("/tmp/a..b/c.txt"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "permission_denied");
    }

    #[tokio::test]
    async fn missing_file_is_source_missing() {
        let dir = TempDir::new().unwrap();
        let validator = PathValidator::default();
        let err = validator
            .validate(&dir.path().join("absent.txt"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "source_missing");
    }

    #[tokio::test]
    async fn enforces_allowlist() {
        let allowed = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let inside_file = allowed.path().join("ok.txt");
        let outside_file = outside.path().join("no.txt");
        tokio::fs::write(&inside_file, b"x").await.unwrap();
        tokio::fs::write(&outside_file, b"x").await.unwrap();

        let validator = PathValidator::new(vec![allowed.path().to_path_buf()]);
        validator.validate(&inside_file).await.unwrap();
        let err = validator.validate(&outside_file).await.unwrap_err();
        assert_eq!(err.kind(), "permission_denied");
    }

    #[tokio::test]
    async fn missing_file_outside_allowlist_is_denied() {
        let allowed = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();

        let validator = PathValidator::new(vec![allowed.path().to_path_buf()]);
        let err = validator
            .validate(&outside.path().join("absent.txt"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "permission_denied");
    }

    #[tokio::test]
    async fn missing_file_inside_allowlist_is_source_missing() {
        let allowed = TempDir::new().unwrap();

        let validator = PathValidator::new(vec![allowed.path().to_path_buf()]);
        let err = validator
            .validate(&allowed.path().join("absent.txt"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "source_missing");
    }

    #[tokio::test]
    async fn rejects_directories() {
        let dir = TempDir::new().unwrap();
        let validator = PathValidator::default();
        let err = validator.validate(dir.path()).await.unwrap_err();
        assert_eq!(err.kind(), "permission_denied");
    }
}
