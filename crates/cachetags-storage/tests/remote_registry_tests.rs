//! Integration tests for the remote registry connection lifecycle.
//!
//! Uses an in-process store that records every connect and disconnect.

use async_trait::async_trait;
use cachetags_core::error::{CacheTagsError, Result};
use cachetags_core::traits::{InspectableRegistry, Registry};
use cachetags_storage::remote::{
    ConnectionPhase, FieldWrite, RemoteConnection, RemoteRegistry, RemoteStore,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Hashes = Arc<Mutex<HashMap<String, BTreeMap<String, String>>>>;

#[derive(Default)]
struct Counters {
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    fail_next_connect: AtomicBool,
}

#[derive(Clone)]
struct StubStore {
    data: Hashes,
    counters: Arc<Counters>,
    connect_delay: Duration,
}

impl StubStore {
    fn new() -> Self {
        Self {
            data: Arc::default(),
            counters: Arc::default(),
            connect_delay: Duration::from_millis(20),
        }
    }

    fn connects(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    fn disconnects(&self) -> usize {
        self.counters.disconnects.load(Ordering::SeqCst)
    }
}

struct StubConnection {
    data: Hashes,
    counters: Arc<Counters>,
}

fn matches_pattern(pattern: &str, key: &str) -> bool {
    let prefix = pattern.trim_end_matches('*').replace('\\', "");
    key.starts_with(&prefix)
}

#[async_trait]
impl RemoteConnection for StubConnection {
    async fn hset_many(&self, writes: &[FieldWrite]) -> Result<()> {
        let mut data = self.data.lock();
        for write in writes {
            data.entry(write.key.clone())
                .or_default()
                .insert(write.field.clone(), write.value.clone());
        }
        Ok(())
    }

    async fn take_hash(&self, key: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .data
            .lock()
            .remove(key)
            .map(|fields| fields.into_iter().collect())
            .unwrap_or_default())
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .data
            .lock()
            .get(key)
            .map(|fields| fields.clone().into_iter().collect())
            .unwrap_or_default())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        Ok(self
            .data
            .lock()
            .keys()
            .filter(|key| matches_pattern(pattern, key))
            .cloned()
            .collect())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let mut data = self.data.lock();
        for key in keys {
            data.remove(key);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.counters.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for StubStore {
    type Connection = StubConnection;

    async fn connect(&self) -> Result<StubConnection> {
        tokio::time::sleep(self.connect_delay).await;

        if self.counters.fail_next_connect.swap(false, Ordering::SeqCst) {
            return Err(CacheTagsError::connection("connection refused"));
        }

        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        Ok(StubConnection {
            data: Arc::clone(&self.data),
            counters: Arc::clone(&self.counters),
        })
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("cachetags_storage=debug")
        .try_init();
}

fn tags(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[tokio::test]
async fn test_register_and_extract() {
    let registry = RemoteRegistry::new(StubStore::new());

    registry.register("some-path", &tags(&["tag1"])).await.unwrap();

    assert_eq!(registry.extract("tag1").await.unwrap(), vec!["some-path"]);
    assert!(registry.extract("tag1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_extract_keeps_store_field_order() {
    let store = StubStore::new();
    {
        let mut data = store.data.lock();
        let fields = data.entry("t".to_string()).or_default();
        for path in ["/c", "/a", "/b"] {
            fields.insert(path.to_string(), "2024-01-01T00:00:00.000Z".to_string());
        }
    }
    let expected: Vec<String> = store.data.lock()["t"].keys().cloned().collect();

    let registry = RemoteRegistry::new(store.clone());
    assert_eq!(registry.extract("t").await.unwrap(), expected);
}

#[tokio::test]
async fn test_concurrent_actions_share_one_connection() {
    init_tracing();
    let store = StubStore::new();
    let registry = RemoteRegistry::new(store.clone());

    let t1 = tags(&["t1"]);
    let (a, b) = tokio::join!(registry.register("/a", &t1), registry.register("/b", &t1));
    a.unwrap();
    b.unwrap();

    assert_eq!(store.connects(), 1);
    assert_eq!(store.disconnects(), 1);
    assert_eq!(registry.phase(), ConnectionPhase::Disconnected);
    assert_eq!(registry.holders(), 0);

    let mut paths = registry.extract("t1").await.unwrap();
    paths.sort();
    assert_eq!(paths, vec!["/a", "/b"]);
}

#[tokio::test]
async fn test_sequential_actions_reconnect() {
    let store = StubStore::new();
    let registry = RemoteRegistry::new(store.clone());

    registry.register("/a", &tags(&["t"])).await.unwrap();
    registry.register("/b", &tags(&["t"])).await.unwrap();

    assert_eq!(store.connects(), 2);
    assert_eq!(store.disconnects(), 2);
}

#[tokio::test]
async fn test_action_during_drain_waits_for_fresh_connection() {
    init_tracing();
    let store = StubStore::new();
    let registry = Arc::new(RemoteRegistry::new(store.clone()));

    let first = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.register("/a", &tags(&["t"])).await })
    };

    // Arrive while the first action is closing its connection.
    let second = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            loop {
                if registry.phase() == ConnectionPhase::Draining {
                    break;
                }
                tokio::task::yield_now().await;
            }
            registry.register("/b", &tags(&["t"])).await
        })
    };

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    assert_eq!(store.connects(), 2);
    assert_eq!(store.disconnects(), 2);
    assert_eq!(registry.phase(), ConnectionPhase::Disconnected);
}

#[tokio::test]
async fn test_connect_failure_is_reported_and_recovers() {
    let store = StubStore::new();
    let registry = RemoteRegistry::new(store.clone());

    store.counters.fail_next_connect.store(true, Ordering::SeqCst);
    let err = registry.register("/a", &tags(&["t"])).await.unwrap_err();
    assert!(err.is_connection());
    assert_eq!(registry.phase(), ConnectionPhase::Disconnected);
    assert_eq!(registry.holders(), 0);

    registry.register("/a", &tags(&["t"])).await.unwrap();
    assert_eq!(registry.extract("t").await.unwrap(), vec!["/a"]);
}

#[tokio::test]
async fn test_connect_failure_reaches_every_waiter() {
    let store = StubStore::new();
    let registry = RemoteRegistry::new(store.clone());

    store.counters.fail_next_connect.store(true, Ordering::SeqCst);
    let t = tags(&["t"]);
    let (a, b) = tokio::join!(registry.register("/a", &t), registry.register("/b", &t));

    assert!(a.unwrap_err().is_connection());
    assert!(b.unwrap_err().is_connection());
    assert_eq!(registry.holders(), 0);
    assert_eq!(store.connects(), 0);
}

#[tokio::test]
async fn test_key_prefix_is_applied() {
    let store = StubStore::new();
    let registry = RemoteRegistry::new(store.clone()).with_key_prefix("site:");

    registry.register("/a", &tags(&["t1"])).await.unwrap();

    let data = store.data.lock();
    assert!(data.contains_key("site:t1"));
    assert!(!data.contains_key("t1"));
}

#[tokio::test]
async fn test_timestamps_are_rfc3339() {
    let store = StubStore::new();
    let registry = RemoteRegistry::new(store.clone());

    registry.register("/a", &tags(&["t1"])).await.unwrap();

    let stamp = store.data.lock()["t1"]["/a"].clone();
    assert!(chrono::DateTime::parse_from_rfc3339(&stamp).is_ok());
    assert!(stamp.ends_with('Z'));
}

#[tokio::test]
async fn test_cache_info_and_clear_respect_prefix() {
    let store = StubStore::new();
    store
        .data
        .lock()
        .entry("other:t".to_string())
        .or_default()
        .insert("/foreign".to_string(), "2024-01-01T00:00:00.000Z".to_string());

    let registry = RemoteRegistry::new(store.clone()).with_key_prefix("site:");
    registry.register("/a", &tags(&["t1", "t2"])).await.unwrap();
    registry.register("/b", &tags(&["t2"])).await.unwrap();

    let info = registry.cache_info().await.unwrap();
    assert_eq!(info.keys().cloned().collect::<Vec<_>>(), vec!["/a", "/b"]);

    registry.clear().await.unwrap();
    assert!(registry.cache_info().await.unwrap().is_empty());
    assert!(store.data.lock().contains_key("other:t"));
}

#[tokio::test]
async fn test_malformed_timestamp_is_skipped() {
    let store = StubStore::new();
    store
        .data
        .lock()
        .entry("t".to_string())
        .or_default()
        .insert("/bad".to_string(), "yesterday".to_string());

    let registry = RemoteRegistry::new(store.clone());
    registry.register("/good", &tags(&["t"])).await.unwrap();

    let info = registry.cache_info().await.unwrap();
    assert!(info.contains_key("/good"));
    assert!(!info.contains_key("/bad"));
}
