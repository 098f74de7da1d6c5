//! Shared object storage behind tiered trees.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use tierdb_core::config::TieredStorageConfig;
use tierdb_core::error::{Error, Result};

/// Where flushed generations end up. `flush` may be slow and may fail with
/// [`Error::Storage`]; `flush_finish` releases whatever `flush` set up.
pub trait StorageSource: Send + Sync {
    /// Copy a local file to the object store under `object`.
    fn flush(&self, local: &Path, object: &str) -> Result<()>;

    /// Complete a flush once metadata reflects it.
    fn flush_finish(&self, local: &Path, object: &str) -> Result<()>;

    /// Whether `object` is present in the store.
    fn exists(&self, object: &str) -> Result<bool>;
}

/// A directory standing in for a bucket. Objects are written to
/// `<prefix><name>.flushing` and renamed into place by `flush_finish`.
pub struct BucketStorage {
    bucket: PathBuf,
    prefix: String,
}

impl BucketStorage {
    pub fn new(bucket: impl Into<PathBuf>, prefix: impl Into<String>) -> Result<Self> {
        let bucket = bucket.into();
        fs::create_dir_all(&bucket).map_err(|e| Error::Storage {
            message: format!("{}: {}", bucket.display(), e),
        })?;
        Ok(Self {
            bucket,
            prefix: prefix.into(),
        })
    }

    pub fn from_config(config: &TieredStorageConfig) -> Result<Self> {
        Self::new(&config.bucket, config.bucket_prefix.clone())
    }

    pub fn object_path(&self, object: &str) -> PathBuf {
        self.bucket.join(format!("{}{}", self.prefix, object))
    }

    fn flushing_path(&self, object: &str) -> PathBuf {
        self.bucket.join(format!("{}{}.flushing", self.prefix, object))
    }
}

fn storage_err(path: &Path, e: std::io::Error) -> Error {
    Error::Storage {
        message: format!("{}: {}", path.display(), e),
    }
}

impl StorageSource for BucketStorage {
    fn flush(&self, local: &Path, object: &str) -> Result<()> {
        let dest = self.flushing_path(object);
        let bytes = fs::copy(local, &dest).map_err(|e| storage_err(local, e))?;
        debug!("copied {} ({} bytes) to {}", local.display(), bytes, dest.display());
        Ok(())
    }

    fn flush_finish(&self, _local: &Path, object: &str) -> Result<()> {
        let from = self.flushing_path(object);
        let to = self.object_path(object);
        fs::rename(&from, &to).map_err(|e| storage_err(&from, e))
    }

    fn exists(&self, object: &str) -> Result<bool> {
        Ok(self.object_path(object).exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_flush_then_finish() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("t-0000000001.wtobj");
        fs::write(&local, b"data").unwrap();

        let bucket = BucketStorage::new(dir.path().join("bucket"), "pfx-").unwrap();
        bucket.flush(&local, "t-0000000001.wtobj").unwrap();
        assert!(!bucket.exists("t-0000000001.wtobj").unwrap());

        bucket.flush_finish(&local, "t-0000000001.wtobj").unwrap();
        assert!(bucket.exists("t-0000000001.wtobj").unwrap());
        assert_eq!(fs::read(bucket.object_path("t-0000000001.wtobj")).unwrap(), b"data");
        assert!(dir.path().join("bucket/pfx-t-0000000001.wtobj").exists());
    }

    #[test]
    fn test_missing_local_is_storage_error() {
        let dir = TempDir::new().unwrap();
        let bucket = BucketStorage::new(dir.path().join("bucket"), "").unwrap();
        let err = bucket.flush(&dir.path().join("nope"), "nope").unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
    }
}
