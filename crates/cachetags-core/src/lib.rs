//! Core types and abstractions for tag-based cache invalidation.
//!
//! This crate provides the error type, tag hashing, the registry traits every
//! storage backend implements, and the configuration model shared by the
//! storage and orchestration crates.

pub mod config;
pub mod error;
pub mod hash;
pub mod traits;

pub use config::{
    CacheTagsConfig, FileRegistryConfig, InvalidationConfig, RegistryConfig,
    RemoteRegistryConfig,
};
pub use error::{CacheTagsError, Result};
pub use hash::{default_hash, TagHasher};
pub use traits::{InspectableRegistry, Registry};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{CacheTagsConfig, RegistryConfig};
    pub use crate::error::{CacheTagsError, Result};
    pub use crate::hash::TagHasher;
    pub use crate::traits::{InspectableRegistry, Registry};
}
