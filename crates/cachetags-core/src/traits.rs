//! Registry traits implemented by every storage backend.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Storage for the tag → paths inverted index.
///
/// Tags reaching a registry are already hashed by the orchestrator; the
/// registry treats them as opaque keys.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Associate `path` with every tag in `tags`.
    ///
    /// Registering the same pair twice keeps a single membership and only
    /// refreshes its timestamp.
    async fn register(&self, path: &str, tags: &[String]) -> Result<()>;

    /// Remove and return every path associated with `tag`.
    ///
    /// Returns an empty list for unknown tags. A second extraction right after
    /// the first returns nothing unless the tag was registered again.
    async fn extract(&self, tag: &str) -> Result<Vec<String>>;
}

/// Maintenance operations for registries whose contents can be listed.
#[async_trait]
pub trait InspectableRegistry: Registry {
    /// Latest registration timestamp of every registered path, across all tags.
    async fn cache_info(&self) -> Result<BTreeMap<String, DateTime<Utc>>>;

    /// Drop every association.
    async fn clear(&self) -> Result<()>;
}

#[async_trait]
impl<R: Registry + ?Sized> Registry for Arc<R> {
    async fn register(&self, path: &str, tags: &[String]) -> Result<()> {
        (**self).register(path, tags).await
    }

    async fn extract(&self, tag: &str) -> Result<Vec<String>> {
        (**self).extract(tag).await
    }
}

#[async_trait]
impl<R: Registry + ?Sized> Registry for Box<R> {
    async fn register(&self, path: &str, tags: &[String]) -> Result<()> {
        (**self).register(path, tags).await
    }

    async fn extract(&self, tag: &str) -> Result<Vec<String>> {
        (**self).extract(tag).await
    }
}

#[async_trait]
impl<R: InspectableRegistry + ?Sized> InspectableRegistry for Arc<R> {
    async fn cache_info(&self) -> Result<BTreeMap<String, DateTime<Utc>>> {
        (**self).cache_info().await
    }

    async fn clear(&self) -> Result<()> {
        (**self).clear().await
    }
}

/// Fold `(path, timestamp)` pairs into the latest timestamp per path.
pub fn latest_per_path<I>(entries: I) -> BTreeMap<String, DateTime<Utc>>
where
    I: IntoIterator<Item = (String, DateTime<Utc>)>,
{
    let mut latest: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();
    for (path, at) in entries {
        latest
            .entry(path)
            .and_modify(|current| {
                if at > *current {
                    *current = at;
                }
            })
            .or_insert(at);
    }
    latest
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_latest_per_path_keeps_newest() {
        let old = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let new = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();

        let latest = latest_per_path(vec![
            ("/a".to_string(), new),
            ("/a".to_string(), old),
            ("/b".to_string(), old),
        ]);

        assert_eq!(latest.len(), 2);
        assert_eq!(latest["/a"], new);
        assert_eq!(latest["/b"], old);
    }
}
