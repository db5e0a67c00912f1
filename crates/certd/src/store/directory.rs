//! File-per-key certificate store.
//!
//! # Directory Structure
//!
//! ```text
//! storage/
//! ├── self-signed          # key + certificate bundle
//! ├── example.com
//! └── www.example.com
//! ```
//!
//! The base directory is created with mode 0700 and every entry with mode
//! 0600 since each one holds a private key.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, trace};

use super::{validate_key, CertStore};
use crate::error::StoreError;

/// Certificate store backed by a local directory
#[derive(Debug)]
pub struct DirStore {
    base_path: PathBuf,
}

impl DirStore {
    /// Open a store rooted at `base_path`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or permissions
    /// cannot be set.
    pub fn new(base_path: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(base_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(base_path, fs::Permissions::from_mode(0o700))?;
        }

        info!(
            storage_path = %base_path.display(),
            "Initialized certificate store"
        );

        Ok(Self {
            base_path: base_path.to_path_buf(),
        })
    }

    /// Get the storage base path
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn entry_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.base_path.join(key))
    }
}

#[async_trait]
impl CertStore for DirStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.entry_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => {
                debug!(key = %key, bytes = data.len(), "Loaded certificate store entry");
                Ok(data)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!(key = %key, "No stored entry found");
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let path = self.entry_path(key)?;
        let base_path = self.base_path.clone();
        let prefix = format!(".{key}.");
        let bytes = data.len();
        let data = data.to_vec();

        // Each writer gets its own temp file; the rename is the only shared step
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut tmp = tempfile::Builder::new()
                .prefix(&prefix)
                .suffix(".tmp")
                .tempfile_in(&base_path)?;
            tmp.write_all(&data)?;
            tmp.as_file().sync_all()?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tmp.as_file()
                    .set_permissions(fs::Permissions::from_mode(0o600))?;
            }

            tmp.persist(&path).map_err(|e| StoreError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Backend(format!("store write task failed: {e}")))??;

        debug!(key = %key, bytes, "Saved certificate store entry");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.entry_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(key = %key, "Deleted certificate store entry");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_store() -> (TempDir, DirStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = DirStore::new(&temp_dir.path().join("certs")).unwrap();
        (temp_dir, store)
    }

    #[test]
    fn test_store_creation() {
        let (_temp_dir, store) = setup_store();
        assert!(store.base_path().exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(store.base_path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[tokio::test]
    async fn test_put_get() {
        let (_temp_dir, store) = setup_store();

        store.put("example.com", b"bundle").await.unwrap();
        assert_eq!(store.get("example.com").await.unwrap(), b"bundle");

        store.put("example.com", b"replaced").await.unwrap();
        assert_eq!(store.get("example.com").await.unwrap(), b"replaced");
    }

    #[tokio::test]
    async fn test_entry_permissions() {
        let (_temp_dir, store) = setup_store();
        store.put("example.com", b"secret").await.unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let path = store.base_path().join("example.com");
            let mode = fs::metadata(path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_missing_is_not_found() {
        let (_temp_dir, store) = setup_store();
        let err = store.get("nonexistent.com").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_unreadable_entry_is_io_error() {
        let (_temp_dir, store) = setup_store();
        // A directory where a file is expected
        fs::create_dir(store.base_path().join("broken.com")).unwrap();

        let err = store.get("broken.com").await.unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
    }

    #[tokio::test]
    async fn test_invalid_key_rejected() {
        let (_temp_dir, store) = setup_store();
        let err = store.put("../escape", b"x").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_to_one_key() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("certs");
        let a = std::sync::Arc::new(DirStore::new(&path).unwrap());
        let b = std::sync::Arc::new(DirStore::new(&path).unwrap());

        let payload_a = vec![b'a'; 1 << 20];
        let payload_b = vec![b'b'; 1 << 20];

        for _ in 0..20 {
            let (ra, rb) = tokio::join!(
                {
                    let a = std::sync::Arc::clone(&a);
                    let data = payload_a.clone();
                    tokio::spawn(async move { a.put("example.com", &data).await })
                },
                {
                    let b = std::sync::Arc::clone(&b);
                    let data = payload_b.clone();
                    tokio::spawn(async move { b.put("example.com", &data).await })
                },
            );
            ra.unwrap().unwrap();
            rb.unwrap().unwrap();

            let stored = a.get("example.com").await.unwrap();
            assert!(stored == payload_a || stored == payload_b);
        }

        // No temp files left behind
        let leftovers = fs::read_dir(&path)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_delete() {
        let (_temp_dir, store) = setup_store();

        store.put("delete.com", b"x").await.unwrap();
        store.delete("delete.com").await.unwrap();
        assert!(store.get("delete.com").await.unwrap_err().is_not_found());

        // Deleting again is fine
        store.delete("delete.com").await.unwrap();
    }
}
