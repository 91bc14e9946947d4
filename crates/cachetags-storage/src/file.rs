//! Registry persisted to a single JSON document.
//!
//! Several processes may share the document, so every read-modify-write goes
//! through an advisory lock stored in the document itself:
//!
//! ```json
//! {
//!   "lock": null,
//!   "3x0k2a": { "/posts/1": "2024-05-01T10:00:00.000Z" }
//! }
//! ```
//!
//! Claiming a free lock is a read-check-write on the document, so it runs
//! inside a claim gate: a sidecar `<file>.lock` created exclusively and
//! removed right after the claim write. A gate left behind by a crashed
//! claimant is removed once it stays unchanged for the whole retry budget.
//!
//! The lock is cooperative and coarse: it serializes every operation of every
//! process sharing the file. Fine for a single server or a handful of workers,
//! not for a cluster.

use async_trait::async_trait;
use cachetags_core::config::FileRegistryConfig;
use cachetags_core::error::{CacheTagsError, Result};
use cachetags_core::traits::{latest_per_path, InspectableRegistry, Registry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Reserved top-level key holding the current lock token
pub const LOCK_KEY: &str = "lock";

/// Default document name, created in the working directory
pub const DEFAULT_FILE_NAME: &str = "cache.json";

/// On-disk layout of the registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryDocument {
    /// Token of the current lock holder, `None` when free
    #[serde(default)]
    pub lock: Option<String>,
    /// Tag → (path → last registration)
    #[serde(flatten)]
    pub tags: BTreeMap<String, BTreeMap<String, DateTime<Utc>>>,
}

/// Lock acquisition tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLockOptions {
    /// Pause between two checks of a held lock
    pub retry_interval: Duration,
    /// Checks of a held lock before deciding it is stale or contended
    pub max_retries: u32,
}

impl Default for FileLockOptions {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(100),
            max_retries: 50,
        }
    }
}

/// Registry stored in a JSON file shared between processes.
#[derive(Debug)]
pub struct FileRegistry {
    path: PathBuf,
    options: FileLockOptions,
    /// Serializes `act` calls made through this instance.
    local: Mutex<()>,
}

impl FileRegistry {
    /// Create a registry backed by `path` with default lock options
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_options(path, FileLockOptions::default())
    }

    /// Create a registry backed by `path` with custom lock options
    pub fn with_options(path: impl Into<PathBuf>, options: FileLockOptions) -> Self {
        Self {
            path: path.into(),
            options,
            local: Mutex::new(()),
        }
    }

    /// Create a registry from its configuration section
    pub fn from_config(config: &FileRegistryConfig) -> Self {
        Self::with_options(
            config.path.clone(),
            FileLockOptions {
                retry_interval: config.retry_interval(),
                max_retries: config.max_retries,
            },
        )
    }

    /// Create a registry at `./cache.json`
    pub fn in_current_dir() -> Result<Self> {
        let cwd = std::env::current_dir()?;
        Ok(Self::new(cwd.join(DEFAULT_FILE_NAME)))
    }

    /// Location of the registry document
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lock options in use
    pub fn options(&self) -> FileLockOptions {
        self.options
    }

    /// Read the current document without taking the lock.
    ///
    /// Writes replace the file atomically, so the result is always a complete
    /// document, possibly already outdated.
    pub async fn document(&self) -> Result<RegistryDocument> {
        self.read_document().await
    }

    /// Run a read-modify-write `action` on the document under the lock.
    ///
    /// The updated document is written back with the lock released.
    pub async fn act<R, F>(&self, action: F) -> Result<R>
    where
        F: FnOnce(&mut RegistryDocument) -> R + Send,
        R: Send,
    {
        let _local = self.local.lock().await;

        let (token, mut document) = self.acquire().await?;

        let result = action(&mut document);
        document.lock = None;

        if let Err(e) = self.write_document(&document).await {
            self.release_after_failure(&token).await;
            return Err(e);
        }

        debug!(path = %self.path.display(), token = %token, "Released registry lock");
        Ok(result)
    }

    /// Acquire the document lock, returning our token and the document read
    /// while holding it.
    async fn acquire(&self) -> Result<(String, RegistryDocument)> {
        let token = Uuid::new_v4().simple().to_string();
        let mut attempts: u32 = 0;
        let mut first_holder: Option<LockHolder> = None;
        let mut takeover: Option<String> = None;

        loop {
            let document = self.read_document().await?;
            if document.lock.as_deref() == Some(token.as_str()) {
                debug!(path = %self.path.display(), token = %token, "Acquired registry lock");
                return Ok((token, document));
            }

            let holder = match self.claim(&token, takeover.take().as_deref()).await? {
                Claim::Claimed => continue,
                Claim::Held(holder) => holder,
            };

            let first = first_holder.get_or_insert_with(|| holder.clone());
            attempts += 1;

            if attempts > self.options.max_retries {
                if *first == holder {
                    warn!(
                        path = %self.path.display(),
                        holder = %holder,
                        attempts,
                        "Registry lock never changed hands, taking over stale lock"
                    );
                    match holder {
                        LockHolder::Document(stale) => takeover = Some(stale),
                        LockHolder::Gate(stale) => self.remove_stale_gate(&stale).await?,
                    }
                    continue;
                }

                return Err(CacheTagsError::LockContention {
                    path: self.path.display().to_string(),
                    attempts,
                });
            }

            debug!(
                path = %self.path.display(),
                holder = %holder,
                attempts,
                "Registry lock held, waiting"
            );
            tokio::time::sleep(self.options.retry_interval).await;
        }
    }

    /// Try to write our token into a free lock.
    ///
    /// The read-check-write runs inside the claim gate, so two claims never
    /// interleave. `takeover` names a stale holder that may be overwritten.
    async fn claim(&self, token: &str, takeover: Option<&str>) -> Result<Claim> {
        self.ensure_parent().await?;

        let gate_path = self.gate_path();
        let Some(_gate) = ClaimGate::try_enter(&gate_path, token).await? else {
            let holder = tokio::fs::read_to_string(&gate_path)
                .await
                .unwrap_or_default();
            return Ok(Claim::Held(LockHolder::Gate(holder)));
        };

        let mut document = self.read_document().await?;
        match document.lock.as_deref() {
            None => {}
            Some(holder) if holder == token => return Ok(Claim::Claimed),
            Some(holder) if takeover == Some(holder) => {
                debug!(path = %self.path.display(), holder, "Overwriting stale lock holder");
            }
            Some(holder) => return Ok(Claim::Held(LockHolder::Document(holder.to_string()))),
        }

        document.lock = Some(token.to_string());
        self.write_document(&document).await?;
        Ok(Claim::Claimed)
    }

    /// Remove a claim gate left behind by a crashed claimant.
    async fn remove_stale_gate(&self, observed: &str) -> Result<()> {
        let gate_path = self.gate_path();
        let current = match tokio::fs::read_to_string(&gate_path).await {
            Ok(current) => current,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if current == observed {
            match tokio::fs::remove_file(&gate_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Best-effort lock release after a failed write.
    async fn release_after_failure(&self, token: &str) {
        let released = async {
            let mut document = self.read_document().await?;
            if document.lock.as_deref() == Some(token) {
                document.lock = None;
                self.write_document(&document).await?;
            }
            Ok::<_, CacheTagsError>(())
        }
        .await;

        if let Err(e) = released {
            warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to release registry lock"
            );
        }
    }

    async fn read_document(&self) -> Result<RegistryDocument> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(RegistryDocument::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(RegistryDocument::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write through a sibling temp file and rename it over the document.
    async fn write_document(&self, document: &RegistryDocument) -> Result<()> {
        let content = serde_json::to_vec_pretty(document)?;
        self.ensure_parent().await?;

        let temp = self.temp_path();
        tokio::fs::write(&temp, content).await?;
        if let Err(e) = tokio::fs::rename(&temp, &self.path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }

        Ok(())
    }

    async fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string())
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_file_name(format!(
            ".{}.{}.tmp",
            self.file_name(),
            Uuid::new_v4().simple()
        ))
    }

    /// Sidecar file guarding the claim step, e.g. `cache.json.lock`
    pub fn gate_path(&self) -> PathBuf {
        self.path
            .with_file_name(format!("{}.{}", self.file_name(), LOCK_KEY))
    }
}

/// Who kept us from claiming the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LockHolder {
    /// Token stored in the document's `lock` field
    Document(String),
    /// Token of another claimant inside the claim gate
    Gate(String),
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Document(token) => write!(f, "{}", token),
            Self::Gate(token) => write!(f, "claim:{}", token),
        }
    }
}

enum Claim {
    Claimed,
    Held(LockHolder),
}

/// Exclusive sidecar file, created with `create_new` and removed on drop.
struct ClaimGate {
    path: PathBuf,
}

impl ClaimGate {
    async fn try_enter(path: &Path, token: &str) -> Result<Option<Self>> {
        let open = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await;

        match open {
            Ok(mut file) => {
                let gate = Self {
                    path: path.to_path_buf(),
                };
                file.write_all(token.as_bytes()).await?;
                file.flush().await?;
                Ok(Some(gate))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for ClaimGate {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove claim gate");
            }
        }
    }
}

fn ensure_not_reserved(tag: &str) -> Result<()> {
    if tag == LOCK_KEY {
        return Err(CacheTagsError::invalid_input(format!(
            "'{}' is reserved by the file registry",
            LOCK_KEY
        )));
    }
    Ok(())
}

#[async_trait]
impl Registry for FileRegistry {
    async fn register(&self, path: &str, tags: &[String]) -> Result<()> {
        for tag in tags {
            ensure_not_reserved(tag)?;
        }

        let now = Utc::now();
        self.act(|document| {
            for tag in tags {
                document
                    .tags
                    .entry(tag.clone())
                    .or_default()
                    .insert(path.to_string(), now);
            }
        })
        .await
    }

    async fn extract(&self, tag: &str) -> Result<Vec<String>> {
        ensure_not_reserved(tag)?;

        self.act(|document| {
            document
                .tags
                .remove(tag)
                .map(|paths| paths.into_keys().collect())
                .unwrap_or_default()
        })
        .await
    }
}

#[async_trait]
impl InspectableRegistry for FileRegistry {
    async fn cache_info(&self) -> Result<BTreeMap<String, DateTime<Utc>>> {
        let document = self.read_document().await?;
        Ok(latest_per_path(
            document.tags.into_values().flat_map(|paths| paths.into_iter()),
        ))
    }

    async fn clear(&self) -> Result<()> {
        self.act(|document| document.tags.clear()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_layout() {
        let json = r#"{
            "lock": null,
            "abc": { "/a": "2024-05-01T10:00:00.000Z" }
        }"#;

        let document: RegistryDocument = serde_json::from_str(json).unwrap();
        assert!(document.lock.is_none());
        assert_eq!(document.tags.len(), 1);
        assert!(document.tags["abc"].contains_key("/a"));
    }

    #[test]
    fn test_document_without_lock_key() {
        let document: RegistryDocument =
            serde_json::from_str(r#"{ "t1": {} }"#).unwrap();
        assert!(document.lock.is_none());
        assert!(document.tags["t1"].is_empty());
    }

    #[test]
    fn test_serialized_lock_is_top_level() {
        let mut document = RegistryDocument::default();
        document.lock = Some("token".to_string());

        let value = serde_json::to_value(&document).unwrap();
        assert_eq!(value["lock"], "token");
    }

    #[test]
    fn test_reserved_tag() {
        assert!(ensure_not_reserved("lock").is_err());
        assert!(ensure_not_reserved("locks").is_ok());
    }

    #[test]
    fn test_from_config() {
        let mut config = FileRegistryConfig::new("/tmp/tags.json");
        config.retry_interval_ms = 5;
        config.max_retries = 3;

        let registry = FileRegistry::from_config(&config);
        assert_eq!(registry.path(), Path::new("/tmp/tags.json"));
        assert_eq!(registry.options().retry_interval, Duration::from_millis(5));
        assert_eq!(registry.options().max_retries, 3);
    }

    #[tokio::test]
    async fn test_claim_gate_is_exclusive() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = FileRegistry::new(dir.path().join("tags.json"));
        assert_eq!(registry.gate_path(), dir.path().join("tags.json.lock"));

        let gate = ClaimGate::try_enter(&registry.gate_path(), "first")
            .await
            .unwrap();
        assert!(gate.is_some());
        assert!(ClaimGate::try_enter(&registry.gate_path(), "second")
            .await
            .unwrap()
            .is_none());
        assert_eq!(std::fs::read_to_string(registry.gate_path()).unwrap(), "first");

        drop(gate);
        assert!(!registry.gate_path().exists());
    }
}
