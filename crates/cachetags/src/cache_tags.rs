//! The orchestrator tying hashing, registration and invalidation together.

use crate::invalidator::{InvalidationHandler, InvalidationResponse, InvalidatorConfig};
use cachetags_core::config::CacheTagsConfig;
use cachetags_core::error::Result;
use cachetags_core::hash::TagHasher;
use cachetags_core::traits::Registry;
use cachetags_storage::AnyRegistry;
use std::sync::Arc;
use tracing::info;

/// Registers rendered paths under their tags and builds invalidation handlers.
pub struct CacheTags<R: ?Sized> {
    registry: Arc<R>,
    hasher: TagHasher,
    log: bool,
    wait: bool,
}

impl<R: ?Sized> Clone for CacheTags<R> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            hasher: self.hasher.clone(),
            log: self.log,
            wait: self.wait,
        }
    }
}

impl<R: Registry> CacheTags<R> {
    /// Create an orchestrator with the default hash, logging off
    pub fn new(registry: R) -> Self {
        Self::from_shared(Arc::new(registry))
    }

    /// Create an orchestrator from its configuration
    pub fn from_config(registry: R, config: &CacheTagsConfig) -> Self {
        Self::new(registry)
            .with_logging(config.log)
            .with_hasher(TagHasher::from_flag(config.hash_tags))
            .with_wait(config.invalidation.wait)
    }
}

impl CacheTags<AnyRegistry> {
    /// Open the configured backend and build an orchestrator on it
    pub fn open(config: &CacheTagsConfig) -> Result<Self> {
        config.validate()?;
        let registry = AnyRegistry::from_config(&config.registry)?;
        Ok(Self::from_config(registry, config))
    }
}

impl<R: Registry + ?Sized> CacheTags<R> {
    /// Create an orchestrator over a registry shared with other owners
    pub fn from_shared(registry: Arc<R>) -> Self {
        Self {
            registry,
            hasher: TagHasher::Default,
            log: false,
            wait: false,
        }
    }

    pub fn with_logging(mut self, log: bool) -> Self {
        self.log = log;
        self
    }

    pub fn with_hasher(mut self, hasher: TagHasher) -> Self {
        self.hasher = hasher;
        self
    }

    /// Default wait mode for handlers that do not set one
    pub fn with_wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    /// The backing registry
    pub fn registry(&self) -> &Arc<R> {
        &self.registry
    }

    pub fn hasher(&self) -> &TagHasher {
        &self.hasher
    }

    /// Hash a tag the way it is stored in the registry
    pub fn generate_hash(&self, tag: &str) -> String {
        self.hasher.hash(tag)
    }

    /// Associate `path` with every tag in `tags`.
    pub async fn register(&self, path: &str, tags: &[String]) -> Result<()> {
        let hashed = self.hasher.hash_all(tags);

        if self.log {
            info!(path = %path, tags = tags.len(), "Registering cache tags");
        }

        self.registry.register(path, &hashed).await
    }

    /// Build a handler for invalidation requests.
    pub fn invalidator<Req, Res>(
        &self,
        config: InvalidatorConfig<Req, Res>,
    ) -> InvalidationHandler<R, Req, Res>
    where
        Req: Sync,
        Res: InvalidationResponse,
    {
        InvalidationHandler::new(
            Arc::clone(&self.registry),
            self.hasher.clone(),
            self.log,
            self.wait,
            config,
        )
    }
}
