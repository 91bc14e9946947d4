//! Registry backed by a remote key/value store.
//!
//! Each tag is one hash entry (`path -> timestamp`). All actions running at
//! the same time share a single connection:
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected (N holders) ──► Draining ──► Disconnected
//! ```
//!
//! The first action opens the connection, actions arriving meanwhile await the
//! same connect, and the last action to finish closes it. A new action that
//! arrives while the connection is draining waits for the disconnect to
//! complete before opening a fresh one.

use async_trait::async_trait;
use cachetags_core::error::{CacheTagsError, Result};
use cachetags_core::traits::{latest_per_path, InspectableRegistry, Registry};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

// ==============================================================================
// Store Seam
// ==============================================================================

/// One hash field write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldWrite {
    pub key: String,
    pub field: String,
    pub value: String,
}

/// An open connection to the remote store.
#[async_trait]
pub trait RemoteConnection: Send + Sync + 'static {
    /// Apply every write in a single transaction
    async fn hset_many(&self, writes: &[FieldWrite]) -> Result<()>;

    /// Read all fields of `key` and delete the key in one atomic step.
    ///
    /// Fields come back in the order the store returns them.
    async fn take_hash(&self, key: &str) -> Result<Vec<(String, String)>>;

    /// Read all fields of `key`
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>>;

    /// List keys matching a glob pattern
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Delete keys
    async fn delete(&self, keys: &[String]) -> Result<()>;

    /// Release the connection. No command is issued on it afterwards.
    async fn disconnect(&self) -> Result<()>;
}

/// Factory for remote connections.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    type Connection: RemoteConnection;

    /// Open a new connection
    async fn connect(&self) -> Result<Self::Connection>;
}

// ==============================================================================
// Connection Lifecycle
// ==============================================================================

type SharedConnect<C> = Shared<BoxFuture<'static, std::result::Result<Arc<C>, String>>>;
type SharedDrain = Shared<BoxFuture<'static, ()>>;

/// Observable phase of the shared connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    Draining,
}

enum ConnectionState<C> {
    Disconnected,
    Connecting {
        generation: u64,
        future: SharedConnect<C>,
    },
    Connected {
        generation: u64,
        connection: Arc<C>,
    },
    Draining {
        generation: u64,
        future: SharedDrain,
    },
}

struct Lifecycle<C> {
    state: ConnectionState<C>,
    /// Actions currently holding, or waiting for, the connection
    holders: usize,
    next_generation: u64,
}

enum Step<C> {
    Ready(Arc<C>),
    Open,
    Connect(u64, SharedConnect<C>),
    Drain(u64, SharedDrain),
}

enum Wait<C> {
    Connect(u64, SharedConnect<C>),
    Drain(u64, SharedDrain),
}

// ==============================================================================
// Remote Registry
// ==============================================================================

/// Registry storing one remote hash per tag.
pub struct RemoteRegistry<S: RemoteStore> {
    store: Arc<S>,
    key_prefix: String,
    lifecycle: Mutex<Lifecycle<S::Connection>>,
}

impl<S: RemoteStore> RemoteRegistry<S> {
    /// Create a registry on top of `store`
    pub fn new(store: S) -> Self {
        Self {
            store: Arc::new(store),
            key_prefix: String::new(),
            lifecycle: Mutex::new(Lifecycle {
                state: ConnectionState::Disconnected,
                holders: 0,
                next_generation: 0,
            }),
        }
    }

    /// Prefix every stored key with `prefix`
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// The underlying store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Current phase of the shared connection
    pub fn phase(&self) -> ConnectionPhase {
        match self.lifecycle.lock().state {
            ConnectionState::Disconnected => ConnectionPhase::Disconnected,
            ConnectionState::Connecting { .. } => ConnectionPhase::Connecting,
            ConnectionState::Connected { .. } => ConnectionPhase::Connected,
            ConnectionState::Draining { .. } => ConnectionPhase::Draining,
        }
    }

    /// Number of actions holding or awaiting the connection
    pub fn holders(&self) -> usize {
        self.lifecycle.lock().holders
    }

    fn key(&self, tag: &str) -> String {
        format!("{}{}", self.key_prefix, tag)
    }

    /// Run `action` against the shared connection.
    pub async fn act<T, F, Fut>(&self, action: F) -> Result<T>
    where
        F: FnOnce(Arc<S::Connection>) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let connection = self.checkout().await?;
        let result = action(connection).await;
        self.checkin().await;
        result
    }

    /// Join the shared connection, opening it if needed.
    async fn checkout(&self) -> Result<Arc<S::Connection>> {
        loop {
            let wait = {
                let mut guard = self.lifecycle.lock();
                let lifecycle = &mut *guard;

                let step = match &lifecycle.state {
                    ConnectionState::Connected { connection, .. } => {
                        Step::Ready(Arc::clone(connection))
                    }
                    ConnectionState::Connecting { generation, future } => {
                        Step::Connect(*generation, future.clone())
                    }
                    ConnectionState::Draining { generation, future } => {
                        Step::Drain(*generation, future.clone())
                    }
                    ConnectionState::Disconnected => Step::Open,
                };

                match step {
                    Step::Ready(connection) => {
                        lifecycle.holders += 1;
                        return Ok(connection);
                    }
                    Step::Open => {
                        let generation = lifecycle.next_generation;
                        lifecycle.next_generation += 1;

                        let store = Arc::clone(&self.store);
                        let future = async move {
                            store
                                .connect()
                                .await
                                .map(Arc::new)
                                .map_err(|e| e.to_string())
                        }
                        .boxed()
                        .shared();

                        debug!(generation, "Opening remote connection");
                        lifecycle.state = ConnectionState::Connecting {
                            generation,
                            future: future.clone(),
                        };
                        lifecycle.holders += 1;
                        Wait::Connect(generation, future)
                    }
                    Step::Connect(generation, future) => {
                        lifecycle.holders += 1;
                        Wait::Connect(generation, future)
                    }
                    Step::Drain(generation, future) => Wait::Drain(generation, future),
                }
            };

            match wait {
                Wait::Drain(generation, future) => {
                    debug!(generation, "Waiting for remote connection to drain");
                    future.await;
                    self.finish_drain(generation);
                }
                Wait::Connect(generation, future) => {
                    let outcome = future.await;
                    let mut lifecycle = self.lifecycle.lock();
                    let current = matches!(
                        lifecycle.state,
                        ConnectionState::Connecting { generation: g, .. } if g == generation
                    );

                    return match outcome {
                        Ok(connection) => {
                            if current {
                                debug!(generation, "Remote connection established");
                                lifecycle.state = ConnectionState::Connected {
                                    generation,
                                    connection: Arc::clone(&connection),
                                };
                            }
                            Ok(connection)
                        }
                        Err(message) => {
                            lifecycle.holders = lifecycle.holders.saturating_sub(1);
                            if current {
                                lifecycle.state = ConnectionState::Disconnected;
                            }
                            Err(CacheTagsError::connection(message))
                        }
                    };
                }
            }
        }
    }

    /// Leave the shared connection, closing it when we were the last holder.
    async fn checkin(&self) {
        let drain = {
            let mut guard = self.lifecycle.lock();
            let lifecycle = &mut *guard;
            lifecycle.holders = lifecycle.holders.saturating_sub(1);

            if lifecycle.holders > 0 {
                None
            } else {
                match std::mem::replace(&mut lifecycle.state, ConnectionState::Disconnected) {
                    ConnectionState::Connected {
                        generation,
                        connection,
                    } => {
                        let future = async move {
                            if let Err(e) = connection.disconnect().await {
                                warn!(generation, error = %e, "Failed to close remote connection");
                            }
                        }
                        .boxed()
                        .shared();

                        lifecycle.state = ConnectionState::Draining {
                            generation,
                            future: future.clone(),
                        };
                        Some((generation, future))
                    }
                    other => {
                        lifecycle.state = other;
                        None
                    }
                }
            }
        };

        if let Some((generation, future)) = drain {
            debug!(generation, "Closing remote connection");
            future.await;
            self.finish_drain(generation);
        }
    }

    fn finish_drain(&self, generation: u64) {
        let mut lifecycle = self.lifecycle.lock();
        if matches!(
            lifecycle.state,
            ConnectionState::Draining { generation: g, .. } if g == generation
        ) {
            lifecycle.state = ConnectionState::Disconnected;
            debug!(generation, "Remote connection closed");
        }
    }

    fn key_pattern(&self) -> String {
        let mut pattern = String::with_capacity(self.key_prefix.len() + 1);
        for c in self.key_prefix.chars() {
            if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern.push('*');
        pattern
    }
}

#[async_trait]
impl<S: RemoteStore> Registry for RemoteRegistry<S> {
    async fn register(&self, path: &str, tags: &[String]) -> Result<()> {
        if tags.is_empty() {
            return Ok(());
        }

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let writes: Vec<FieldWrite> = tags
            .iter()
            .map(|tag| FieldWrite {
                key: self.key(tag),
                field: path.to_string(),
                value: now.clone(),
            })
            .collect();

        self.act(move |connection| async move { connection.hset_many(&writes).await })
            .await
    }

    async fn extract(&self, tag: &str) -> Result<Vec<String>> {
        let key = self.key(tag);
        let fields = self
            .act(move |connection| async move { connection.take_hash(&key).await })
            .await?;

        Ok(fields.into_iter().map(|(path, _)| path).collect())
    }
}

#[async_trait]
impl<S: RemoteStore> InspectableRegistry for RemoteRegistry<S> {
    async fn cache_info(&self) -> Result<BTreeMap<String, DateTime<Utc>>> {
        let pattern = self.key_pattern();

        self.act(move |connection| async move {
            let mut entries = Vec::new();

            for key in connection.keys(&pattern).await? {
                for (path, at) in connection.hgetall(&key).await? {
                    match DateTime::parse_from_rfc3339(&at) {
                        Ok(at) => entries.push((path, at.with_timezone(&Utc))),
                        Err(e) => warn!(key = %key, path = %path, error = %e, "Skipping malformed timestamp"),
                    }
                }
            }

            Ok::<_, CacheTagsError>(latest_per_path(entries))
        })
        .await
    }

    async fn clear(&self) -> Result<()> {
        let pattern = self.key_pattern();

        self.act(move |connection| async move {
            let keys = connection.keys(&pattern).await?;
            if !keys.is_empty() {
                connection.delete(&keys).await?;
            }
            Ok::<_, CacheTagsError>(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopStore;

    struct NoopConnection;

    #[async_trait]
    impl RemoteConnection for NoopConnection {
        async fn hset_many(&self, _writes: &[FieldWrite]) -> Result<()> {
            Ok(())
        }

        async fn take_hash(&self, _key: &str) -> Result<Vec<(String, String)>> {
            Ok(Vec::new())
        }

        async fn hgetall(&self, _key: &str) -> Result<Vec<(String, String)>> {
            Ok(Vec::new())
        }

        async fn keys(&self, _pattern: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn delete(&self, _keys: &[String]) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl RemoteStore for NoopStore {
        type Connection = NoopConnection;

        async fn connect(&self) -> Result<NoopConnection> {
            Ok(NoopConnection)
        }
    }

    #[test]
    fn test_key_prefix() {
        let registry = RemoteRegistry::new(NoopStore).with_key_prefix("site:");
        assert_eq!(registry.key("abc"), "site:abc");
        assert_eq!(registry.key_pattern(), "site:*");
    }

    #[test]
    fn test_key_pattern_escapes_glob() {
        let registry = RemoteRegistry::new(NoopStore).with_key_prefix("a*[b]");
        assert_eq!(registry.key_pattern(), "a\\*\\[b\\]*");
    }

    #[tokio::test]
    async fn test_lifecycle_returns_to_disconnected() {
        let registry = RemoteRegistry::new(NoopStore);
        assert_eq!(registry.phase(), ConnectionPhase::Disconnected);

        registry
            .register("/a", &["t1".to_string()])
            .await
            .unwrap();

        assert_eq!(registry.phase(), ConnectionPhase::Disconnected);
        assert_eq!(registry.holders(), 0);
    }

    #[tokio::test]
    async fn test_empty_register_skips_connection() {
        let registry = RemoteRegistry::new(NoopStore);
        registry.register("/a", &[]).await.unwrap();
        assert_eq!(registry.phase(), ConnectionPhase::Disconnected);
    }
}
