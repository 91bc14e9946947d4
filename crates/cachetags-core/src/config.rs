//! Configuration for cache tags.
//!
//! Configuration is read from a TOML file (`cachetags.toml` in the working
//! directory by default, overridable with `CACHE_TAGS_CONFIG_PATH`) and then
//! patched with environment variable overrides.
//!
//! # Example
//!
//! ```toml
//! log = true
//! hash_tags = true
//!
//! [invalidation]
//! wait = false
//!
//! [registry]
//! backend = "file"
//! path = "cache.json"
//! retry_interval_ms = 100
//! max_retries = 50
//! ```

use crate::error::{CacheTagsError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Default configuration file name, relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "cachetags.toml";

/// Default registry document for the file backend
pub const DEFAULT_REGISTRY_FILE: &str = "cache.json";

/// Default pause between two lock checks of the file backend
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 100;

/// Default number of lock checks before the file backend gives up
pub const DEFAULT_MAX_RETRIES: u32 = 50;

// Environment variable names
pub const ENV_CONFIG_PATH: &str = "CACHE_TAGS_CONFIG_PATH";
pub const ENV_LOG: &str = "CACHE_TAGS_LOG";
pub const ENV_HASH: &str = "CACHE_TAGS_HASH";
pub const ENV_WAIT: &str = "CACHE_TAGS_WAIT";
pub const ENV_FILE_PATH: &str = "CACHE_TAGS_FILE_PATH";
pub const ENV_REDIS_URL: &str = "CACHE_TAGS_REDIS_URL";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheTagsConfig {
    /// Emit structured diagnostics for register/invalidate
    #[serde(default)]
    pub log: bool,
    /// Hash tags before storing them; `false` stores raw tags
    #[serde(default = "default_true")]
    pub hash_tags: bool,
    #[serde(default)]
    pub invalidation: InvalidationConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

/// Invalidation handler settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvalidationConfig {
    /// Await every dispatched revalidation before responding
    #[serde(default)]
    pub wait: bool,
}

/// Registry backend selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum RegistryConfig {
    /// Process-local registry
    #[default]
    Memory,
    /// Shared JSON file with cooperative locking
    File(FileRegistryConfig),
    /// Remote key/value store
    Remote(RemoteRegistryConfig),
}

/// File backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRegistryConfig {
    #[serde(default = "default_registry_file")]
    pub path: PathBuf,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Remote backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRegistryConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379/0`
    pub url: String,
    /// Prefix prepended to every stored key
    #[serde(default)]
    pub key_prefix: String,
}

fn default_true() -> bool {
    true
}

fn default_registry_file() -> PathBuf {
    PathBuf::from(DEFAULT_REGISTRY_FILE)
}

fn default_retry_interval_ms() -> u64 {
    DEFAULT_RETRY_INTERVAL_MS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Default for CacheTagsConfig {
    fn default() -> Self {
        Self {
            log: false,
            hash_tags: true,
            invalidation: InvalidationConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

impl Default for FileRegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_file(),
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl FileRegistryConfig {
    /// Create a file configuration for the given document path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Pause between two lock checks
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl RemoteRegistryConfig {
    /// Create a remote configuration for the given URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            key_prefix: String::new(),
        }
    }

    /// Set the key prefix
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

impl RegistryConfig {
    /// Backend name as written in the configuration file
    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::File(_) => "file",
            Self::Remote(_) => "remote",
        }
    }
}

impl CacheTagsConfig {
    /// Load configuration from `CACHE_TAGS_CONFIG_PATH` or `./cachetags.toml`,
    /// falling back to defaults when no file exists, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed, or if the
    /// resulting configuration is invalid
    pub async fn load() -> Result<Self> {
        let path = Self::config_path();

        let mut config = if tokio::fs::try_exists(&path).await? {
            Self::load_from_path(&path).await?
        } else {
            debug!("No configuration file at {}, using defaults", path.display());
            Self::default()
        };

        config.merge_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific TOML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed
    pub async fn load_from_path(path: &Path) -> Result<Self> {
        debug!("Loading configuration from {}", path.display());

        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            CacheTagsError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| {
            CacheTagsError::config(format!("Failed to parse {}: {}", path.display(), e))
        })?;

        info!(
            backend = config.registry.backend_name(),
            "Loaded configuration from {}",
            path.display()
        );
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails
    pub async fn save_to_path(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| CacheTagsError::config(format!("Failed to serialize config: {}", e)))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        tokio::fs::write(path, content).await?;
        debug!("Saved configuration to {}", path.display());
        Ok(())
    }

    /// Configuration file location
    pub fn config_path() -> PathBuf {
        std::env::var(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns a `Config` error describing the first invalid field
    pub fn validate(&self) -> Result<()> {
        match &self.registry {
            RegistryConfig::Memory => {}
            RegistryConfig::File(file) => {
                if file.path.as_os_str().is_empty() {
                    return Err(CacheTagsError::config("File registry path cannot be empty"));
                }
                if file.max_retries == 0 {
                    return Err(CacheTagsError::config(
                        "max_retries must be greater than 0",
                    ));
                }
            }
            RegistryConfig::Remote(remote) => {
                if remote.url.trim().is_empty() {
                    return Err(CacheTagsError::config("Remote registry URL cannot be empty"));
                }
            }
        }

        Ok(())
    }

    /// Merge environment variable overrides into the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if an environment variable holds an invalid value
    pub fn merge_env_vars(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// `CACHE_TAGS_FILE_PATH` selects the file backend and
    /// `CACHE_TAGS_REDIS_URL` the remote one; when both are set the remote
    /// backend wins.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_LOG) {
            self.log = parse_flag(ENV_LOG, &value)?;
            debug!("Overriding log from environment: {}", self.log);
        }

        if let Some(value) = lookup(ENV_HASH) {
            self.hash_tags = parse_flag(ENV_HASH, &value)?;
            debug!("Overriding hash_tags from environment: {}", self.hash_tags);
        }

        if let Some(value) = lookup(ENV_WAIT) {
            self.invalidation.wait = parse_flag(ENV_WAIT, &value)?;
            debug!("Overriding invalidation.wait from environment: {}", self.invalidation.wait);
        }

        if let Some(path) = lookup(ENV_FILE_PATH) {
            debug!("Overriding file registry path from environment: {}", path);
            match &mut self.registry {
                RegistryConfig::File(file) => file.path = PathBuf::from(path),
                other => *other = RegistryConfig::File(FileRegistryConfig::new(path)),
            }
        }

        if let Some(url) = lookup(ENV_REDIS_URL) {
            debug!("Overriding remote registry URL from environment");
            match &mut self.registry {
                RegistryConfig::Remote(remote) => remote.url = url,
                other => *other = RegistryConfig::Remote(RemoteRegistryConfig::new(url)),
            }
        }

        Ok(())
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(CacheTagsError::config(format!(
            "Invalid boolean '{}' for {}",
            other, key
        ))),
    }
}
