//! Error types for cache-tag registries and invalidation.

/// Result type alias for cache-tag operations.
pub type Result<T> = std::result::Result<T, CacheTagsError>;

/// Main error type for cache-tag operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheTagsError {
    /// Registry backend errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The file lock kept changing hands while we waited for it
    #[error("Could not establish safe connection to {path}: lock still contended after {attempts} attempts")]
    LockContention { path: String, attempts: u32 },

    /// Remote store connection errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// Remote store command errors
    #[error("Remote store error: {0}")]
    Remote(String),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The tag resolver failed before any tag was extracted
    #[error(transparent)]
    Resolution(anyhow::Error),

    /// Wrapped anyhow errors for compatibility
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CacheTagsError {
    /// Create a new storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a new remote command error
    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Wrap a tag resolver failure
    pub fn resolution(error: impl Into<anyhow::Error>) -> Self {
        Self::Resolution(error.into())
    }

    /// Check if this error came from the tag resolver
    pub fn is_resolution(&self) -> bool {
        matches!(self, Self::Resolution(_))
    }

    /// Check if this is a lock contention error
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, Self::LockContention { .. })
    }

    /// Check if this is a remote connection error
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}
