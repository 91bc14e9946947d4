//! Redis-backed remote store.

use crate::remote::{FieldWrite, RemoteConnection, RemoteStore};
use async_trait::async_trait;
use cachetags_core::error::{CacheTagsError, Result};
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisError};
use tracing::debug;

fn remote_error(e: RedisError) -> CacheTagsError {
    CacheTagsError::remote(e.to_string())
}

/// Opens multiplexed connections to a Redis server.
#[derive(Debug, Clone)]
pub struct RedisStore {
    client: Client,
}

impl RedisStore {
    /// Create a store for `url`, e.g. `redis://127.0.0.1:6379/0`.
    ///
    /// Only parses the URL; nothing is contacted until the first action.
    pub fn open(url: &str) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| CacheTagsError::config(format!("Invalid redis url: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    type Connection = RedisConnection;

    async fn connect(&self) -> Result<RedisConnection> {
        let inner = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CacheTagsError::connection(e.to_string()))?;

        debug!("Connected to redis");
        Ok(RedisConnection {
            inner: Mutex::new(Some(inner)),
        })
    }
}

/// One multiplexed Redis connection.
///
/// The socket closes once every handle is dropped; `disconnect` drops ours,
/// so commands issued afterwards fail with a connection error.
pub struct RedisConnection {
    inner: Mutex<Option<MultiplexedConnection>>,
}

impl RedisConnection {
    fn handle(&self) -> Result<MultiplexedConnection> {
        self.inner
            .lock()
            .clone()
            .ok_or_else(|| CacheTagsError::connection("Redis connection already closed"))
    }
}

#[async_trait]
impl RemoteConnection for RedisConnection {
    async fn hset_many(&self, writes: &[FieldWrite]) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for write in writes {
            pipe.hset(&write.key, &write.field, &write.value).ignore();
        }

        let mut conn = self.handle()?;
        let _: () = pipe.query_async(&mut conn).await.map_err(remote_error)?;
        Ok(())
    }

    async fn take_hash(&self, key: &str) -> Result<Vec<(String, String)>> {
        let mut conn = self.handle()?;
        let (fields,): (Vec<(String, String)>,) = redis::pipe()
            .atomic()
            .hgetall(key)
            .del(key)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(remote_error)?;

        Ok(fields)
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        let mut conn = self.handle()?;
        conn.hgetall(key).await.map_err(remote_error)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.handle()?;
        conn.keys(pattern).await.map_err(remote_error)
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let mut conn = self.handle()?;
        let _: () = conn.del(keys).await.map_err(remote_error)?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.inner.lock().take().is_some() {
            debug!("Released redis connection");
        }
        Ok(())
    }
}
