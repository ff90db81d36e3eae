//! Version-gated object cache
//!
//! An in-memory mirror of VolumeSnapshots and VolumeSnapshotContents fed by
//! the initial list and the watch stream. `upsert` rejects an object whose
//! resourceVersion is numerically older than the cached copy, so a late
//! watch event can never roll the mirror back.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kube::Resource;
use lattice_common::kube_utils::resource_version;
use lattice_common::{Error, Result};
use tracing::trace;

/// Cache key of an object: `namespace/name`, or `name` when cluster-scoped
pub fn object_key<K: Resource>(obj: &K) -> String {
    let meta = obj.meta();
    let name = meta.name.as_deref().unwrap_or_default();
    match meta.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    }
}

/// Split a cache key into namespace and name
pub fn split_key(key: &str) -> (Option<&str>, &str) {
    match key.split_once('/') {
        Some((ns, name)) => (Some(ns), name),
        None => (None, key),
    }
}

fn version_of<K: Resource>(obj: &K) -> Result<u64> {
    resource_version(obj.meta()).ok_or_else(|| {
        Error::internal_with_context(
            "cache",
            format!(
                "cannot parse resourceVersion {:?} of {}",
                obj.meta().resource_version,
                object_key(obj)
            ),
        )
    })
}

/// Concurrent, version-gated store of one resource kind
pub struct ObjectCache<K> {
    items: DashMap<String, K>,
}

impl<K> Default for ObjectCache<K> {
    fn default() -> Self {
        Self {
            items: DashMap::new(),
        }
    }
}

impl<K: Resource + Clone> ObjectCache<K> {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `obj` unless the cached copy is strictly newer
    ///
    /// Returns whether the cache changed. Equal versions are accepted so that
    /// periodic resyncs re-trigger processing.
    pub fn upsert(&self, obj: &K) -> Result<bool> {
        let new_version = version_of(obj)?;
        match self.items.entry(object_key(obj)) {
            Entry::Vacant(slot) => {
                slot.insert(obj.clone());
                Ok(true)
            }
            Entry::Occupied(mut slot) => {
                let old_version = version_of(slot.get())?;
                if old_version > new_version {
                    trace!(
                        key = %slot.key(),
                        old_version,
                        new_version,
                        "ignoring stale object"
                    );
                    return Ok(false);
                }
                slot.insert(obj.clone());
                Ok(true)
            }
        }
    }

    /// Owned copy of the cached object for `key`
    pub fn get(&self, key: &str) -> Option<K> {
        self.items.get(key).map(|entry| entry.value().clone())
    }

    /// Owned copies of every cached object
    pub fn list(&self) -> Vec<K> {
        self.items.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Every cached key
    pub fn keys(&self) -> Vec<String> {
        self.items.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Remove `key`, returning the last cached copy
    pub fn delete(&self, key: &str) -> Option<K> {
        self.items.remove(key).map(|(_, v)| v)
    }

    /// Number of cached objects
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_common::crd::{VolumeSnapshot, VolumeSnapshotContent, VolumeSnapshotSpec};

    fn snapshot(version: &str, content: &str) -> VolumeSnapshot {
        let mut snap = VolumeSnapshot::new(
            "snap-1",
            VolumeSnapshotSpec {
                snapshot_content_name: Some(content.to_string()),
                ..Default::default()
            },
        );
        snap.metadata.namespace = Some("default".to_string());
        snap.metadata.resource_version = Some(version.to_string());
        snap
    }

    #[test]
    fn keys_follow_scope() {
        assert_eq!(object_key(&snapshot("1", "c")), "default/snap-1");
        let content = VolumeSnapshotContent::new("c-1", Default::default());
        assert_eq!(object_key(&content), "c-1");
        assert_eq!(split_key("default/snap-1"), (Some("default"), "snap-1"));
        assert_eq!(split_key("c-1"), (None, "c-1"));
    }

    #[test]
    fn stale_versions_are_rejected() {
        let cache = ObjectCache::new();
        assert!(cache.upsert(&snapshot("10", "a")).expect("insert"));
        assert!(!cache.upsert(&snapshot("9", "b")).expect("stale"));

        let cached = cache.get("default/snap-1").expect("cached");
        assert_eq!(cached.content_name(), Some("a"));
    }

    #[test]
    fn versions_compare_numerically() {
        let cache = ObjectCache::new();
        assert!(cache.upsert(&snapshot("9", "a")).expect("insert"));
        // "10" < "9" lexicographically
        assert!(cache.upsert(&snapshot("10", "b")).expect("newer"));
        assert_eq!(
            cache.get("default/snap-1").and_then(|s| s.spec.snapshot_content_name),
            Some("b".to_string())
        );
    }

    #[test]
    fn equal_versions_are_accepted() {
        let cache = ObjectCache::new();
        assert!(cache.upsert(&snapshot("5", "a")).expect("insert"));
        assert!(cache.upsert(&snapshot("5", "b")).expect("resync"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn unparseable_version_is_an_error() {
        let cache = ObjectCache::new();
        assert!(cache.upsert(&snapshot("abc", "a")).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn delete_returns_last_copy() {
        let cache = ObjectCache::new();
        cache.upsert(&snapshot("1", "a")).expect("insert");
        assert_eq!(cache.keys(), vec!["default/snap-1".to_string()]);
        assert!(cache.delete("default/snap-1").is_some());
        assert!(cache.delete("default/snap-1").is_none());
        assert!(cache.list().is_empty());
    }
}
