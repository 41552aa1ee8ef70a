//! Lock-free cache of master-key metadata, keyed by `(scope, region)`.
//!
//! Every encrypt call resolves one master key per region, so lookups sit on
//! the hot path. Writers copy the map and swap it in atomically.

use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwap;
use common::KeyMetadata;

type CacheKey = (String, String);

/// Shared metadata cache; clones see the same entries.
#[derive(Clone, Debug)]
pub struct KeyMetadataCache {
    inner: Arc<ArcSwap<HashMap<CacheKey, KeyMetadata>>>,
}

impl KeyMetadataCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ArcSwap::new(Arc::new(HashMap::new()))),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.load().is_empty()
    }

    pub fn get(&self, scope: &str, region: &str) -> Option<KeyMetadata> {
        self.inner
            .load()
            .get(&(scope.to_owned(), region.to_owned()))
            .cloned()
    }

    /// Insert or replace the entry for `metadata.scope` and `metadata.region`.
    pub fn insert(&self, metadata: KeyMetadata) {
        let key = (metadata.scope.clone(), metadata.region.clone());
        self.inner.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(key.clone(), metadata.clone());
            next
        });
    }

    pub fn remove(&self, scope: &str, region: &str) {
        let key = (scope.to_owned(), region.to_owned());
        self.inner.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(&key);
            next
        });
    }
}

impl Default for KeyMetadataCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn metadata(scope: &str, region: &str, key_id: &str) -> KeyMetadata {
        let now = Utc::now();
        KeyMetadata {
            id: "m1".into(),
            scope: scope.into(),
            region: region.into(),
            key_id: key_id.into(),
            created_ts: now,
            created_by: "test".into(),
            last_updated_ts: now,
            last_updated_by: "test".into(),
            last_validated_ts: now,
        }
    }

    #[test]
    fn initially_empty() {
        let cache = KeyMetadataCache::new();
        assert!(cache.is_empty());
        assert!(cache.get("sdb:a", "us-west-2").is_none());
    }

    #[test]
    fn insert_replace_and_remove() {
        let cache = KeyMetadataCache::new();
        cache.insert(metadata("sdb:a", "us-west-2", "k1"));
        cache.insert(metadata("sdb:a", "us-east-1", "k2"));
        cache.insert(metadata("sdb:a", "us-west-2", "k3"));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("sdb:a", "us-west-2").unwrap().key_id, "k3");

        cache.remove("sdb:a", "us-west-2");
        assert!(cache.get("sdb:a", "us-west-2").is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn clones_share_entries() {
        let cache = KeyMetadataCache::new();
        let other = cache.clone();
        cache.insert(metadata("principal:arn", "us-west-2", "k1"));
        assert!(other.get("principal:arn", "us-west-2").is_some());
    }
}
