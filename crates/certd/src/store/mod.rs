//! Certificate store: byte blobs addressed by an opaque cache key.
//!
//! Every backend reports a missing key as [`StoreError::NotFound`] so callers
//! can tell a cold cache apart from a broken one. Any other error aborts the
//! operation that hit it.

use std::sync::Arc;

use async_trait::async_trait;
use certd_config::{StorageBackend, StorageConfig};
use tracing::info;

use crate::error::StoreError;

mod directory;
mod memory;
#[cfg(feature = "redis-store")]
mod redis;

pub use directory::DirStore;
pub use memory::MemoryStore;
#[cfg(feature = "redis-store")]
pub use self::redis::RedisStore;

/// Key-value persistence for certificate bundles.
///
/// Implementations must be safe to call concurrently for different keys.
#[async_trait]
pub trait CertStore: Send + Sync {
    /// Read the blob stored under `key`
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Store `data` under `key`, replacing any previous value
    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Open the backend selected by configuration
pub async fn open(config: &StorageConfig) -> Result<Arc<dyn CertStore>, StoreError> {
    let store: Arc<dyn CertStore> = match config.backend {
        StorageBackend::Directory => {
            let path = config.path.as_deref().ok_or_else(|| {
                StoreError::Backend("directory backend requires a path".to_string())
            })?;
            Arc::new(DirStore::new(path)?)
        }
        StorageBackend::Memory => {
            info!("Using in-memory certificate store, certificates will not survive restart");
            Arc::new(MemoryStore::new())
        }
        #[cfg(feature = "redis-store")]
        StorageBackend::Redis => {
            let url = config.url.as_deref().ok_or_else(|| {
                StoreError::Backend("redis backend requires a url".to_string())
            })?;
            Arc::new(RedisStore::connect(url, &config.prefix).await?)
        }
        #[cfg(not(feature = "redis-store"))]
        StorageBackend::Redis => {
            return Err(StoreError::Backend(
                "redis backend requires the 'redis-store' feature".to_string(),
            ));
        }
    };
    Ok(store)
}

/// Reject keys that cannot be mapped onto a file name or remote key
pub(crate) fn validate_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && key.len() <= 255
        && key != "."
        && key != ".."
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_valid_keys_stay_inside_the_store(key in "\\PC{0,80}") {
            if validate_key(&key).is_ok() {
                prop_assert!(!key.contains('/'));
                prop_assert!(!key.contains('\\'));
                prop_assert!(key != "." && key != "..");
                prop_assert!(!key.is_empty());
            }
        }

        #[test]
        fn prop_domain_names_are_valid_keys(labels in proptest::collection::vec("[a-z0-9]([a-z0-9-]{0,10}[a-z0-9])?", 1..5)) {
            prop_assert!(validate_key(&labels.join(".")).is_ok());
        }
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("example.com").is_ok());
        assert!(validate_key("self-signed").is_ok());
        assert!(validate_key("xn--bcher-kva.example").is_ok());

        assert!(validate_key("").is_err());
        assert!(validate_key("..").is_err());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("a/b").is_err());
        assert!(validate_key("*.example.com").is_err());
    }

    #[tokio::test]
    async fn test_open_memory() {
        let config = StorageConfig {
            backend: StorageBackend::Memory,
            path: None,
            ..Default::default()
        };
        let store = open(&config).await.unwrap();
        assert!(store.get("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_open_directory_requires_path() {
        let config = StorageConfig {
            backend: StorageBackend::Directory,
            path: None,
            ..Default::default()
        };
        assert!(open(&config).await.is_err());
    }

    #[cfg(not(feature = "redis-store"))]
    #[tokio::test]
    async fn test_open_redis_without_feature() {
        let config = StorageConfig {
            backend: StorageBackend::Redis,
            url: Some("redis://localhost".to_string()),
            ..Default::default()
        };
        let err = open(&config).await.err().unwrap();
        assert!(err.to_string().contains("redis-store"));
    }
}
