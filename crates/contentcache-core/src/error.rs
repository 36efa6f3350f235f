use thiserror::Error;

/// Error taxonomy for every operation the cache exposes.
///
/// The variants map one-to-one onto the error counters exported by the
/// metrics recorder; [`CacheError::kind`] yields the stable label used there.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("source file missing: {0}")]
    SourceMissing(String),

    #[error("integrity fault: {0}")]
    IntegrityFault(String),

    #[error("storage failure: {0}")]
    StorageFailure(String),

    #[error("processing failed: {0}")]
    ProcessingError(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl CacheError {
    /// Stable label for the per-kind error counters.
    pub fn kind(&self) -> &'static str {
        match self {
            CacheError::PermissionDenied(_) => "permission_denied",
            CacheError::SourceMissing(_) => "source_missing",
            CacheError::IntegrityFault(_) => "integrity_fault",
            CacheError::StorageFailure(_) => "storage_failure",
            CacheError::ProcessingError(_) => "processing_error",
            CacheError::ConfigInvalid(_) => "config_invalid",
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::StorageFailure(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(
            CacheError::PermissionDenied("x".into()).kind(),
            "permission_denied"
        );
        assert_eq!(CacheError::SourceMissing("x".into()).kind(), "source_missing");
        assert_eq!(
            CacheError::ProcessingError("x".into()).kind(),
            "processing_error"
        );
    }

    #[test]
    fn io_errors_surface_as_storage_failures() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err: CacheError = io.into();
        assert_eq!(err.kind(), "storage_failure");
    }
}
