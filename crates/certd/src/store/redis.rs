//! Redis-backed certificate store.
//!
//! Lets several instances share one set of certificates. Keys are stored as
//! `<prefix><cache key>`.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info, trace};

use super::{validate_key, CertStore};
use crate::error::StoreError;

/// Certificate store backed by a Redis server
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisStore {
    /// Connect to `url`, e.g. `redis://127.0.0.1:6379/0`
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(backend_error)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(backend_error)?;

        info!(prefix = %prefix, "Connected to Redis certificate store");

        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    fn redis_key(&self, key: &str) -> Result<String, StoreError> {
        validate_key(key)?;
        Ok(format!("{}{}", self.prefix, key))
    }
}

fn backend_error(e: redis::RedisError) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[async_trait]
impl CertStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let redis_key = self.redis_key(key)?;
        let mut conn = self.conn.clone();
        let data: Option<Vec<u8>> = conn.get(&redis_key).await.map_err(backend_error)?;
        match data {
            Some(data) => {
                debug!(key = %key, bytes = data.len(), "Loaded certificate store entry");
                Ok(data)
            }
            None => {
                trace!(key = %key, "No stored entry found");
                Err(StoreError::NotFound(key.to_string()))
            }
        }
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let redis_key = self.redis_key(key)?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(&redis_key, data)
            .await
            .map_err(backend_error)?;
        debug!(key = %key, bytes = data.len(), "Saved certificate store entry");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let redis_key = self.redis_key(key)?;
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(&redis_key).await.map_err(backend_error)?;
        Ok(())
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
