//! Registry backends for tag-based cache invalidation.
//!
//! - [`MemoryRegistry`]: process-local map
//! - [`FileRegistry`]: JSON document shared through a cooperative file lock
//! - [`RemoteRegistry`]: hashes in a remote key/value store over one shared connection
//!
//! [`AnyRegistry`] picks one of them from a [`RegistryConfig`].

pub mod file;
pub mod memory;
pub mod remote;

#[cfg(feature = "redis")]
pub mod redis_store;

pub use file::{FileLockOptions, FileRegistry, RegistryDocument};
pub use memory::MemoryRegistry;
pub use remote::{ConnectionPhase, FieldWrite, RemoteConnection, RemoteRegistry, RemoteStore};

#[cfg(feature = "redis")]
pub use redis_store::{RedisConnection, RedisStore};

use async_trait::async_trait;
use cachetags_core::config::RegistryConfig;
use cachetags_core::error::Result;
use cachetags_core::traits::{InspectableRegistry, Registry};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::info;

/// Registry chosen at runtime from configuration.
pub enum AnyRegistry {
    Memory(MemoryRegistry),
    File(FileRegistry),
    #[cfg(feature = "redis")]
    Remote(RemoteRegistry<RedisStore>),
}

impl AnyRegistry {
    /// Build the backend described by `config`
    pub fn from_config(config: &RegistryConfig) -> Result<Self> {
        info!(backend = config.backend_name(), "Creating registry");

        match config {
            RegistryConfig::Memory => Ok(Self::Memory(MemoryRegistry::new())),
            RegistryConfig::File(file) => Ok(Self::File(FileRegistry::from_config(file))),
            #[cfg(feature = "redis")]
            RegistryConfig::Remote(remote) => {
                let store = RedisStore::open(&remote.url)?;
                Ok(Self::Remote(
                    RemoteRegistry::new(store).with_key_prefix(remote.key_prefix.clone()),
                ))
            }
            #[cfg(not(feature = "redis"))]
            RegistryConfig::Remote(_) => Err(cachetags_core::error::CacheTagsError::config(
                "Remote registry requires the `redis` feature",
            )),
        }
    }

    /// Backend name, as used in configuration
    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::File(_) => "file",
            #[cfg(feature = "redis")]
            Self::Remote(_) => "remote",
        }
    }
}

#[async_trait]
impl Registry for AnyRegistry {
    async fn register(&self, path: &str, tags: &[String]) -> Result<()> {
        match self {
            Self::Memory(registry) => registry.register(path, tags).await,
            Self::File(registry) => registry.register(path, tags).await,
            #[cfg(feature = "redis")]
            Self::Remote(registry) => registry.register(path, tags).await,
        }
    }

    async fn extract(&self, tag: &str) -> Result<Vec<String>> {
        match self {
            Self::Memory(registry) => registry.extract(tag).await,
            Self::File(registry) => registry.extract(tag).await,
            #[cfg(feature = "redis")]
            Self::Remote(registry) => registry.extract(tag).await,
        }
    }
}

#[async_trait]
impl InspectableRegistry for AnyRegistry {
    async fn cache_info(&self) -> Result<BTreeMap<String, DateTime<Utc>>> {
        match self {
            Self::Memory(registry) => registry.cache_info().await,
            Self::File(registry) => registry.cache_info().await,
            #[cfg(feature = "redis")]
            Self::Remote(registry) => registry.cache_info().await,
        }
    }

    async fn clear(&self) -> Result<()> {
        match self {
            Self::Memory(registry) => registry.clear().await,
            Self::File(registry) => registry.clear().await,
            #[cfg(feature = "redis")]
            Self::Remote(registry) => registry.clear().await,
        }
    }
}

/// Re-export commonly used types
pub mod prelude {
    pub use crate::file::FileRegistry;
    pub use crate::memory::MemoryRegistry;
    pub use crate::remote::{RemoteConnection, RemoteRegistry, RemoteStore};
    pub use crate::AnyRegistry;
}
